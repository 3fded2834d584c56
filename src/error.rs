//! Error taxonomy shared by every Graph-facing operation.
//!
//! All failures that leave the HTTP wrapper or the transfer engines carry
//! exactly one [`ErrorKind`]. Callers branch on the kind; the detail string,
//! HTTP status, API error code and wrapped cause exist for logs and user output.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credentials are missing, expired beyond refresh, or rejected.
    ReauthRequired,
    /// The signed-in user may not access the resource.
    AccessDenied,
    /// Throttled or transient server trouble; retry after a delay.
    RetryLater,
    /// The request is malformed or not allowed for this resource.
    InvalidRequest,
    /// The item or upload session does not exist (or no longer exists).
    ResourceNotFound,
    /// A conflicting item already exists.
    Conflict,
    /// The drive has no space left.
    QuotaExceeded,
    /// Device-code login: the user has not finished signing in yet.
    AuthorizationPending,
    /// Device-code login: the user declined the request.
    AuthorizationDeclined,
    /// Device-code login: the device code expired.
    TokenExpired,
    /// Local failure (filesystem, session store, invariant violation).
    Internal,
    /// A response body could not be decoded.
    DecodingFailed,
    /// No response was obtained (DNS, TLS, timeout, reset).
    NetworkFailed,
    /// The server answered with something the operation cannot use.
    OperationFailed,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::ReauthRequired,
        ErrorKind::AccessDenied,
        ErrorKind::RetryLater,
        ErrorKind::InvalidRequest,
        ErrorKind::ResourceNotFound,
        ErrorKind::Conflict,
        ErrorKind::QuotaExceeded,
        ErrorKind::AuthorizationPending,
        ErrorKind::AuthorizationDeclined,
        ErrorKind::TokenExpired,
        ErrorKind::Internal,
        ErrorKind::DecodingFailed,
        ErrorKind::NetworkFailed,
        ErrorKind::OperationFailed,
    ];

    /// Stable label used in log fields and user output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReauthRequired => "reauth required",
            Self::AccessDenied => "access denied",
            Self::RetryLater => "retry later",
            Self::InvalidRequest => "invalid request",
            Self::ResourceNotFound => "resource not found",
            Self::Conflict => "conflict",
            Self::QuotaExceeded => "quota exceeded",
            Self::AuthorizationPending => "authorization pending",
            Self::AuthorizationDeclined => "authorization declined",
            Self::TokenExpired => "token expired",
            Self::Internal => "internal error",
            Self::DecodingFailed => "decoding failed",
            Self::NetworkFailed => "network failed",
            Self::OperationFailed => "operation failed",
        }
    }

    /// Whether a failed operation of this kind may succeed when repeated unchanged.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RetryLater | Self::NetworkFailed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A classified failure.
#[derive(Debug, Error)]
#[error("{kind}: {detail}")]
pub struct ApiError {
    kind: ErrorKind,
    detail: String,
    status: Option<u16>,
    code: Option<String>,
    retry_after: Option<Duration>,
    #[source]
    source: Option<BoxedCause>,
}

impl ApiError {
    /// Creates an error of `kind` with a human-readable detail.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: None,
            code: None,
            retry_after: None,
            source: None,
        }
    }

    /// Creates an [`ErrorKind::Internal`] error wrapping a local I/O failure.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, context).with_source(source)
    }

    /// Creates an [`ErrorKind::DecodingFailed`] error wrapping a JSON failure.
    pub fn decoding(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::new(ErrorKind::DecodingFailed, context).with_source(source)
    }

    /// Creates an [`ErrorKind::OperationFailed`] error for an unusable response status.
    pub fn unexpected_status(operation: &str, status: u16) -> Self {
        Self::new(
            ErrorKind::OperationFailed,
            format!("{operation}: unexpected HTTP {status}"),
        )
        .with_status(status)
    }

    /// Attaches the HTTP status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches the machine-readable API or OAuth error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches the server-requested delay before retrying.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The category callers branch on.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true when this error belongs to `kind`.
    #[must_use]
    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Human-readable detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// HTTP status, when the failure came from a response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Raw API/OAuth error code, when the server supplied one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Delay requested through a `Retry-After` header.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_api_error_display_includes_kind_and_detail() {
        let error = ApiError::new(ErrorKind::Conflict, "name already exists: report.pdf");
        let msg = error.to_string();
        assert!(msg.starts_with("conflict:"), "unexpected: {msg}");
        assert!(msg.contains("report.pdf"), "unexpected: {msg}");
    }

    #[test]
    fn test_api_error_matches_only_its_kind() {
        let error = ApiError::new(ErrorKind::RetryLater, "throttled");
        assert!(error.matches(ErrorKind::RetryLater));
        for kind in ErrorKind::ALL {
            if kind != ErrorKind::RetryLater {
                assert!(!error.matches(kind), "{kind} should not match");
            }
        }
    }

    #[test]
    fn test_api_error_io_wraps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = ApiError::io("reading /tmp/a.bin", cause);
        assert_eq!(error.kind(), ErrorKind::Internal);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_unexpected_status_is_operation_failed() {
        let error = ApiError::unexpected_status("download chunk", 200);
        assert_eq!(error.kind(), ErrorKind::OperationFailed);
        assert_eq!(error.status(), Some(200));
    }

    #[test]
    fn test_only_retry_later_and_network_failed_are_transient() {
        let transient: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|kind| kind.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![ErrorKind::RetryLater, ErrorKind::NetworkFailed]
        );
    }
}
