//! Access tokens for the Graph transport.
//!
//! The transfer engines only ever see an [`AccessTokenProvider`]. Token
//! storage belongs to the caller: [`RefreshingTokenProvider`] hands every
//! refreshed [`Token`] to an `on_refresh` callback so the caller can persist it.

mod device_code;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{ApiError, ErrorKind};
use crate::http::classify::{
    OAuthErrorBody, classify_device_code_error, classify_oauth_code, classify_status,
    classify_transport,
};
use crate::http::constants::DEFAULT_AUTH_BASE_URL;

pub use device_code::{DeviceAuthorization, DeviceCodeFlow};

/// Scopes requested at login and on refresh.
pub const DEFAULT_SCOPES: &str = "Files.ReadWrite.All offline_access User.Read";

/// Tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// An OAuth2 access token with its refresh token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token for Graph requests.
    pub access_token: String,
    /// Long-lived refresh token, when `offline_access` was granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token {
    /// Whether the access token should be refreshed at `now`.
    #[must_use]
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

/// Supplies bearer tokens to the Graph transport.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Returns a currently valid access token, refreshing if needed.
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// A fixed token; never refreshes.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps an access token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, ApiError> {
        Ok(self.0.clone())
    }
}

/// Callback invoked with every refreshed token.
pub type TokenRefreshed = Arc<dyn Fn(&Token) + Send + Sync>;

/// Identity-platform endpoints for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    authority: String,
    tenant: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_BASE_URL, "common")
    }
}

impl OAuthEndpoints {
    /// Creates endpoints for `tenant` under `authority`.
    pub fn new(authority: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            authority: authority.into().trim_end_matches('/').to_string(),
            tenant: tenant.into(),
        }
    }

    /// Device authorization endpoint.
    #[must_use]
    pub fn device_code_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/devicecode", self.authority, self.tenant)
    }

    /// Token endpoint.
    #[must_use]
    pub fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant)
    }
}

/// Application registration used for every OAuth exchange.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    endpoints: OAuthEndpoints,
    client_id: String,
    scopes: String,
}

impl OAuthClient {
    /// Creates an OAuth client for a public application `client_id`.
    pub fn new(http: Client, endpoints: OAuthEndpoints, client_id: impl Into<String>) -> Self {
        Self {
            http,
            endpoints,
            client_id: client_id.into(),
            scopes: DEFAULT_SCOPES.to_string(),
        }
    }

    /// Overrides the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = scopes.into();
        self
    }

    /// Exchanges a refresh token for a new token.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ReauthRequired`] for a rejected grant,
    /// [`ErrorKind::RetryLater`] for transient identity-platform trouble,
    /// [`ErrorKind::NetworkFailed`] otherwise.
    #[instrument(level = "debug", skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<Token, ApiError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", self.scopes.as_str()),
        ];
        let mut token = self
            .exchange(&form, OAuthVocabulary::Refresh, "refresh token")
            .await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    pub(crate) fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn scopes(&self) -> &str {
        &self.scopes
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Posts a form to the token endpoint without authentication.
    pub(crate) async fn exchange(
        &self,
        form: &[(&str, &str)],
        vocabulary: OAuthVocabulary,
        operation: &str,
    ) -> Result<Token, ApiError> {
        let url = self.endpoints.token_url();
        let response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            ApiError::new(ErrorKind::NetworkFailed, format!("{operation}: reading body"))
                .with_source(e)
        })?;

        if status >= 400 {
            return Err(classify_oauth_failure(status, &body, vocabulary, operation));
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| ApiError::decoding(format!("{operation}: token response"), e))?;
        Ok(parsed.into_token(Utc::now()))
    }
}

/// Which error vocabulary a token-endpoint exchange speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OAuthVocabulary {
    Refresh,
    DeviceCode,
}

fn classify_oauth_failure(
    status: u16,
    body: &[u8],
    vocabulary: OAuthVocabulary,
    operation: &str,
) -> ApiError {
    match serde_json::from_slice::<OAuthErrorBody>(body) {
        Ok(parsed) => {
            let kind = match vocabulary {
                OAuthVocabulary::Refresh => classify_oauth_code(&parsed.error),
                OAuthVocabulary::DeviceCode => classify_device_code_error(&parsed.error),
            };
            let description = parsed.error_description.unwrap_or_default();
            let first_line = description.lines().next().unwrap_or_default();
            ApiError::new(kind, format!("{operation}: {}: {first_line}", parsed.error))
                .with_code(parsed.error)
                .with_status(status)
        }
        Err(_) => ApiError::new(classify_status(status), format!("{operation}: HTTP {status}"))
            .with_status(status),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> Token {
        Token {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + ChronoDuration::seconds(self.expires_in.max(0)),
        }
    }
}

/// Token provider that refreshes transparently and reports new tokens.
pub struct RefreshingTokenProvider {
    oauth: OAuthClient,
    token: Mutex<Token>,
    on_refresh: Option<TokenRefreshed>,
}

impl fmt::Debug for RefreshingTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshingTokenProvider")
            .field("oauth", &self.oauth)
            .finish_non_exhaustive()
    }
}

impl RefreshingTokenProvider {
    /// Creates a provider seeded with a previously stored token.
    pub fn new(oauth: OAuthClient, token: Token) -> Self {
        Self {
            oauth,
            token: Mutex::new(token),
            on_refresh: None,
        }
    }

    /// Registers the callback that persists refreshed tokens.
    #[must_use]
    pub fn on_token_refreshed(mut self, callback: TokenRefreshed) -> Self {
        self.on_refresh = Some(callback);
        self
    }
}

#[async_trait]
impl AccessTokenProvider for RefreshingTokenProvider {
    async fn access_token(&self) -> Result<String, ApiError> {
        let mut current = self.token.lock().await;
        if !current.needs_refresh_at(Utc::now()) {
            return Ok(current.access_token.clone());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(ApiError::new(
                ErrorKind::ReauthRequired,
                "access token expired and no refresh token is stored; run `onedrive login`",
            ));
        };

        debug!(expires_at = %current.expires_at, "refreshing access token");
        let refreshed = self.oauth.refresh(&refresh_token).await?;
        if let Some(callback) = &self.on_refresh {
            callback(&refreshed);
        }
        info!(expires_at = %refreshed.expires_at, "access token refreshed");
        let access_token = refreshed.access_token.clone();
        *current = refreshed;
        Ok(access_token)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn expired_token() -> Token {
        Token {
            access_token: "old".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Utc::now() - ChronoDuration::seconds(5),
        }
    }

    #[test]
    fn test_token_needs_refresh_inside_margin() {
        let now = Utc::now();
        let token = Token {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: now + ChronoDuration::seconds(30),
        };
        assert!(token.needs_refresh_at(now));
        let fresh = Token {
            expires_at: now + ChronoDuration::seconds(600),
            ..token
        };
        assert!(!fresh.needs_refresh_at(now));
    }

    #[test]
    fn test_token_debug_redacts_secrets() {
        let rendered = format!("{:?}", expired_token());
        assert!(!rendered.contains("refresh-1"));
        assert!(!rendered.contains("\"old\""));
    }

    #[test]
    fn test_endpoint_urls() {
        let endpoints = OAuthEndpoints::new("https://login.example.com/", "consumers");
        assert_eq!(
            endpoints.token_url(),
            "https://login.example.com/consumers/oauth2/v2.0/token"
        );
        assert_eq!(
            endpoints.device_code_url(),
            "https://login.example.com/consumers/oauth2/v2.0/devicecode"
        );
    }

    #[tokio::test]
    async fn test_static_token_returns_value() {
        let provider = StaticToken::new("abc");
        assert_eq!(provider.access_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_refresh_invokes_callback_and_keeps_refresh_token() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"access_token":"new","expires_in":3600,"token_type":"Bearer"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let oauth = OAuthClient::new(
            Client::new(),
            OAuthEndpoints::new(server.uri(), "common"),
            "client-id",
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let provider = RefreshingTokenProvider::new(oauth, expired_token()).on_token_refreshed(
            Arc::new(move |token: &Token| {
                assert_eq!(token.access_token, "new");
                assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(provider.access_token().await.unwrap(), "new");
        // Second call uses the cached token.
        assert_eq!(provider.access_token().await.unwrap(), "new");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejected_grant_requires_reauth() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":"invalid_grant","error_description":"AADSTS70000: revoked"}"#,
            ))
            .mount(&server)
            .await;

        let oauth = OAuthClient::new(
            Client::new(),
            OAuthEndpoints::new(server.uri(), "common"),
            "client-id",
        );
        let provider = RefreshingTokenProvider::new(oauth, expired_token());
        let error = provider.access_token().await.unwrap_err();
        assert!(error.matches(ErrorKind::ReauthRequired), "got {error:?}");
        assert_eq!(error.code(), Some("invalid_grant"));
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_token_requires_reauth() {
        let oauth = OAuthClient::new(Client::new(), OAuthEndpoints::default(), "client-id");
        let token = Token {
            refresh_token: None,
            ..expired_token()
        };
        let provider = RefreshingTokenProvider::new(oauth, token);
        let error = provider.access_token().await.unwrap_err();
        assert!(error.matches(ErrorKind::ReauthRequired));
    }
}
