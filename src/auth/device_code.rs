//! OAuth2 device authorization grant (RFC 8628).

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{OAuthClient, OAuthVocabulary, Token};
use crate::error::{ApiError, ErrorKind};
use crate::http::classify::{classify_status, classify_transport};

/// Seconds added to the poll interval when the server answers `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// What the user must do to approve the login.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    /// Opaque code exchanged for a token once approved.
    pub device_code: String,
    /// Code the user types at `verification_uri`.
    pub user_code: String,
    /// Page where the user approves the request.
    pub verification_uri: String,
    /// Lifetime of the device code in seconds.
    pub expires_in: u64,
    /// Minimum delay between polls in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Ready-made instruction text.
    #[serde(default)]
    pub message: Option<String>,
}

fn default_interval() -> u64 {
    5
}

/// Drives a device-code login.
#[derive(Debug, Clone)]
pub struct DeviceCodeFlow {
    oauth: OAuthClient,
}

impl DeviceCodeFlow {
    /// Creates a flow for the given application.
    #[must_use]
    pub fn new(oauth: OAuthClient) -> Self {
        Self { oauth }
    }

    /// Requests a device code.
    ///
    /// # Errors
    ///
    /// Classified transport or status failure of the device authorization endpoint.
    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self) -> Result<DeviceAuthorization, ApiError> {
        let url = self.oauth.endpoints().device_code_url();
        let form = [
            ("client_id", self.oauth.client_id()),
            ("scope", self.oauth.scopes()),
        ];
        let response = self
            .oauth
            .http()
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ApiError::new(
                classify_status(status),
                format!("device authorization: HTTP {status}"),
            )
            .with_status(status));
        }
        let body = response.bytes().await.map_err(|e| {
            ApiError::new(ErrorKind::NetworkFailed, "device authorization: reading body")
                .with_source(e)
        })?;
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::decoding("device authorization: undecodable body", e))
    }

    /// Polls the token endpoint once.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AuthorizationPending`] while the user has not approved yet,
    /// [`ErrorKind::AuthorizationDeclined`], [`ErrorKind::TokenExpired`],
    /// [`ErrorKind::InvalidRequest`], or [`ErrorKind::RetryLater`] for `slow_down`.
    pub async fn poll_once(&self, authorization: &DeviceAuthorization) -> Result<Token, ApiError> {
        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("client_id", self.oauth.client_id()),
            ("device_code", authorization.device_code.as_str()),
        ];
        self.oauth
            .exchange(&form, OAuthVocabulary::DeviceCode, "device code poll")
            .await
    }

    /// Polls until the user approves, declines, or the code expires.
    ///
    /// # Errors
    ///
    /// Any non-pending poll failure; [`ErrorKind::TokenExpired`] once the
    /// device code lifetime has passed.
    #[instrument(level = "debug", skip_all)]
    pub async fn wait_for_token(
        &self,
        authorization: &DeviceAuthorization,
    ) -> Result<Token, ApiError> {
        let deadline = Utc::now()
            + chrono::Duration::seconds(i64::try_from(authorization.expires_in).unwrap_or(900));
        let mut interval = authorization.interval;

        loop {
            match self.poll_once(authorization).await {
                Ok(token) => return Ok(token),
                Err(error) if error.matches(ErrorKind::AuthorizationPending) => {
                    debug!(interval, "authorization pending");
                }
                Err(error) if error.matches(ErrorKind::RetryLater) => {
                    interval += SLOW_DOWN_STEP_SECS;
                    debug!(interval, "token endpoint asked to slow down");
                }
                Err(error) => return Err(error),
            }

            if Utc::now() >= deadline {
                return Err(ApiError::new(
                    ErrorKind::TokenExpired,
                    "device code expired before the login was approved",
                ));
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }
}
