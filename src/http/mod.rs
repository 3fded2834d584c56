//! Single chokepoint for outbound Graph requests.
//!
//! [`GraphClient::send`] performs exactly one request and either returns the
//! response (status < 400) or an [`ApiError`] classified by [`classify`].
//! It never retries; retry policy lives in the transfer layer.
//!
//! Redirects are not followed automatically: the content endpoint answers
//! with a `302` whose `Location` is a capability URL that must be requested
//! without the bearer token.

pub mod classify;
pub mod constants;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderName, RETRY_AFTER};
use reqwest::{Client, Method, Response, redirect};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::auth::AccessTokenProvider;
use crate::error::{ApiError, ErrorKind};
use classify::{classify_response, classify_transport, loggable_url, parse_retry_after};
use constants::{CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS, USER_AGENT};

/// Timeouts applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout, including reading the body.
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Builds the shared reqwest client used for Graph and capability URLs.
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if the TLS backend cannot be initialised.
pub fn build_http_client(settings: HttpSettings) -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .redirect(redirect::Policy::none())
        .gzip(true)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ApiError::new(ErrorKind::Internal, "failed to build HTTP client").with_source(e))
}

/// One outbound request.
pub struct GraphRequest {
    method: Method,
    url: String,
    operation: &'static str,
    content_type: Option<String>,
    body: Option<reqwest::Body>,
    headers: Vec<(HeaderName, String)>,
    authenticated: bool,
}

impl GraphRequest {
    /// Creates an authenticated request. `operation` names the call in errors and logs.
    pub fn new(method: Method, url: impl Into<String>, operation: &'static str) -> Self {
        Self {
            method,
            url: url.into(),
            operation,
            content_type: None,
            body: None,
            headers: Vec::new(),
            authenticated: true,
        }
    }

    /// Sends the request without a bearer token (pre-authenticated capability URL).
    #[must_use]
    pub fn capability(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Sets the request body and optional content type.
    #[must_use]
    pub fn body(mut self, body: impl Into<reqwest::Body>, content_type: Option<&str>) -> Self {
        self.body = Some(body.into());
        self.content_type = content_type.map(str::to_string);
        self
    }

    /// Serializes `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            ApiError::new(ErrorKind::Internal, format!("{}: encode body", self.operation))
                .with_source(e)
        })?;
        Ok(self.body(bytes, Some("application/json")))
    }

    /// The request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Authenticated Graph transport.
#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GraphClient {
    /// Creates a client rooted at `base_url` (e.g. `https://graph.microsoft.com/v1.0`).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        settings: HttpSettings,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self, ApiError> {
        Ok(Self::with_client(build_http_client(settings)?, base_url, tokens))
    }

    /// Creates a client around an existing reqwest client.
    ///
    /// The client should not follow redirects.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            tokens,
        }
    }

    /// Graph root URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Performs one request and classifies the outcome.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] classified from the transport failure, the
    /// structured error body, or the status code.
    #[instrument(
        level = "debug",
        skip_all,
        fields(
            operation = request.operation,
            method = %request.method,
            url = %loggable_url(&request.url, request.authenticated)
        )
    )]
    pub async fn send(&self, request: GraphRequest) -> Result<Response, ApiError> {
        let GraphRequest {
            method,
            url,
            operation,
            content_type,
            body,
            headers,
            authenticated,
        } = request;

        let mut builder = self.client.request(method, &url);
        if authenticated {
            let token = self.tokens.access_token().await?;
            builder = builder.bearer_auth(token);
        }
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&loggable_url(&url, authenticated), e))?;

        let status = response.status().as_u16();
        debug!(status, "response received");
        if status < 400 {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await.unwrap_or_default();
        let error = classify_response(status, &body, retry_after, operation);
        debug!(kind = %error.kind(), status, "request failed");
        Err(error)
    }

    /// Performs one request and decodes a JSON response body.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`send`](Self::send), plus
    /// [`ErrorKind::DecodingFailed`] for an undecodable body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: GraphRequest,
    ) -> Result<T, ApiError> {
        let operation = request.operation;
        let response = self.send(request).await?;
        decode_json(response, operation).await
    }
}

/// Reads a response body and decodes it as JSON.
///
/// # Errors
///
/// [`ErrorKind::NetworkFailed`] if the body cannot be read,
/// [`ErrorKind::DecodingFailed`] if it is not the expected JSON.
pub async fn decode_json<T: DeserializeOwned>(
    response: Response,
    operation: &str,
) -> Result<T, ApiError> {
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(|e| {
        ApiError::new(ErrorKind::NetworkFailed, format!("{operation}: reading body"))
            .with_source(e)
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ApiError::decoding(format!("{operation}: undecodable body"), e).with_status(status)
    })
}
