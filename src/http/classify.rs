//! Pure classification of HTTP and OAuth failures into [`ErrorKind`].
//!
//! Graph reports errors in two shapes: a structured JSON body
//! (`{"error": {"code": "...", "message": "..."}}`) or a bare status code.
//! Everything here is side-effect free so the tables can be tested exhaustively.
//!
//! # Structured API codes
//!
//! | Code | Kind |
//! |------|------|
//! | accessDenied | AccessDenied |
//! | activityLimitReached, serviceNotAvailable | RetryLater |
//! | itemNotFound | ResourceNotFound |
//! | nameAlreadyExists | Conflict |
//! | invalidRange, invalidRequest, malwareDetected, notAllowed, notSupported, resourceModified, resyncRequired, generalException | InvalidRequest |
//! | quotaLimitReached | QuotaExceeded |
//! | unauthenticated | ReauthRequired |
//!
//! Unknown codes fall back to the status table, keeping the raw code and message
//! in the error detail.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::constants::MAX_RETRY_AFTER;
use crate::error::{ApiError, ErrorKind};

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

/// Maps a structured Graph error code onto a kind.
#[must_use]
pub fn classify_api_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "accessDenied" => ErrorKind::AccessDenied,
        "activityLimitReached" | "serviceNotAvailable" => ErrorKind::RetryLater,
        "itemNotFound" => ErrorKind::ResourceNotFound,
        "nameAlreadyExists" => ErrorKind::Conflict,
        "invalidRange" | "invalidRequest" | "malwareDetected" | "notAllowed" | "notSupported"
        | "resourceModified" | "resyncRequired" | "generalException" => ErrorKind::InvalidRequest,
        "quotaLimitReached" => ErrorKind::QuotaExceeded,
        "unauthenticated" => ErrorKind::ReauthRequired,
        _ => return None,
    };
    Some(kind)
}

/// Maps a bare HTTP error status onto a kind.
///
/// Statuses outside the table classify as [`ErrorKind::OperationFailed`], so
/// every status yields exactly one kind.
#[must_use]
#[allow(clippy::match_same_arms)]
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 | 405 | 406 | 411 | 412 | 413 | 415 | 416 | 422 => ErrorKind::InvalidRequest,
        401 | 403 => ErrorKind::ReauthRequired,
        404 | 410 => ErrorKind::ResourceNotFound,
        409 => ErrorKind::Conflict,
        507 => ErrorKind::QuotaExceeded,
        429 | 500 | 501 | 503 | 509 => ErrorKind::RetryLater,
        _ => ErrorKind::OperationFailed,
    }
}

/// Classifies an error response (status >= 400) from its status and body.
#[must_use]
pub fn classify_response(
    status: u16,
    body: &[u8],
    retry_after: Option<Duration>,
    operation: &str,
) -> ApiError {
    let error = match serde_json::from_slice::<GraphErrorBody>(body) {
        Ok(parsed) => {
            let GraphErrorDetail { code, message } = parsed.error;
            let kind = classify_api_code(&code).unwrap_or_else(|| {
                debug!(code = %code, status, "unrecognized Graph error code");
                classify_status(status)
            });
            ApiError::new(kind, format!("{operation}: {code}: {message} (HTTP {status})"))
                .with_code(code)
        }
        Err(_) => ApiError::new(
            classify_status(status),
            format!("{operation}: HTTP {status}"),
        ),
    };
    error.with_status(status).with_retry_after(retry_after)
}

/// Classifies an OAuth error returned while exchanging or refreshing a token.
///
/// Bad credentials or grants require a new login; transient server trouble is
/// retryable; anything else counts as a transport-level failure.
#[must_use]
pub fn classify_oauth_code(code: &str) -> ErrorKind {
    match code {
        "invalid_grant" | "invalid_client" | "unauthorized_client" | "invalid_scope"
        | "unsupported_grant_type" | "interaction_required" | "consent_required"
        | "login_required" => ErrorKind::ReauthRequired,
        "temporarily_unavailable" | "server_error" => ErrorKind::RetryLater,
        _ => ErrorKind::NetworkFailed,
    }
}

/// Classifies an error from the device-code polling exchange.
#[must_use]
#[allow(clippy::match_same_arms)]
pub fn classify_device_code_error(code: &str) -> ErrorKind {
    match code {
        "authorization_pending" => ErrorKind::AuthorizationPending,
        "authorization_declined" | "access_denied" => ErrorKind::AuthorizationDeclined,
        "expired_token" => ErrorKind::TokenExpired,
        "invalid_request" | "bad_verification_code" => ErrorKind::InvalidRequest,
        "slow_down" => ErrorKind::RetryLater,
        other => classify_oauth_code(other),
    }
}

/// Classifies a failure that happened before any response was obtained.
#[must_use]
pub fn classify_transport(url: &str, source: reqwest::Error) -> ApiError {
    let detail = if source.is_timeout() {
        format!("request to {} timed out", redact_url(url))
    } else if source.is_connect() {
        format!("could not connect to {}", redact_url(url))
    } else {
        format!("request to {} failed", redact_url(url))
    };
    // reqwest embeds the full URL in its message; the detail already names a redacted one.
    ApiError::new(ErrorKind::NetworkFailed, detail).with_source(source.without_url())
}

/// Strips the query string and fragment so capability URLs never reach logs.
#[must_use]
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// URL form safe to log for a request.
///
/// Capability URLs carry their credential in the path, so only the origin of
/// an unauthenticated request is kept.
#[must_use]
pub fn loggable_url(url: &str, authenticated: bool) -> String {
    if authenticated {
        return redact_url(url);
    }
    match Url::parse(url) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Parses a `Retry-After` header (delta-seconds or HTTP-date), capped at one hour.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds maximum, capping at 1 hour");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let duration = datetime
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(duration.min(MAX_RETRY_AFTER))
}
