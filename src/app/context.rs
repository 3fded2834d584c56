//! Shared runtime context built from the CLI flags and the config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use onedrive_core::auth::{OAuthClient, OAuthEndpoints, RefreshingTokenProvider, Token};
use onedrive_core::http::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_AUTH_BASE_URL, DEFAULT_GRAPH_BASE_URL, REQUEST_TIMEOUT_SECS,
};
use onedrive_core::http::{HttpSettings, build_http_client};
use onedrive_core::transfer::DEFAULT_MAX_RETRIES;
use onedrive_core::{GraphClient, SessionStore};
use tracing::{debug, warn};

use crate::app_config::{self, AppConfig};

const DEFAULT_TENANT: &str = "common";

/// Holds the resolved config so command handlers do not re-read it.
#[derive(Debug, Clone)]
pub(crate) struct AppContext {
    pub(crate) config_path: PathBuf,
    pub(crate) config: AppConfig,
}

impl AppContext {
    /// Loads the config from `--config` or the default location.
    pub(crate) fn load(config_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_override {
            Some(path) => path,
            None => app_config::resolve_default_config_path()
                .context("Cannot locate a config directory; set HOME or pass --config")?,
        };
        let config = app_config::load_config(&config_path)?;
        debug!(path = %config_path.display(), "config loaded");
        Ok(Self {
            config_path,
            config,
        })
    }

    pub(crate) fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            connect_timeout: Duration::from_secs(
                self.config.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
            ),
            request_timeout: Duration::from_secs(
                self.config.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS),
            ),
        }
    }

    pub(crate) fn max_retries(&self, flag: Option<u32>) -> u32 {
        flag.or(self.config.max_retries).unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub(crate) fn graph_base_url(&self) -> &str {
        self.config
            .graph_base_url
            .as_deref()
            .unwrap_or(DEFAULT_GRAPH_BASE_URL)
    }

    pub(crate) fn session_store(&self) -> Result<SessionStore> {
        let dir = app_config::resolve_sessions_dir(&self.config, &self.config_path);
        SessionStore::open(&dir)
            .with_context(|| format!("Failed to open sessions directory '{}'", dir.display()))
    }

    /// OAuth client for the configured application; `client_id` overrides the config.
    pub(crate) fn oauth_client(&self, client_id: Option<&str>, tenant: Option<&str>) -> Result<OAuthClient> {
        let Some(client_id) = client_id.or(self.config.client_id.as_deref()) else {
            bail!("No client id configured. Pass --client-id or set `client_id` in the config file");
        };
        let authority = self
            .config
            .auth_base_url
            .as_deref()
            .unwrap_or(DEFAULT_AUTH_BASE_URL);
        let tenant = tenant
            .or(self.config.tenant.as_deref())
            .unwrap_or(DEFAULT_TENANT);
        let http = build_http_client(self.http_settings())?;
        Ok(OAuthClient::new(
            http,
            OAuthEndpoints::new(authority, tenant),
            client_id,
        ))
    }

    /// Graph client authenticated with the stored token.
    ///
    /// Refreshed tokens are written back to the config file.
    pub(crate) fn graph_client(&self) -> Result<GraphClient> {
        let Some(token) = self.config.token.clone() else {
            return Err(onedrive_core::ApiError::new(
                onedrive_core::ErrorKind::ReauthRequired,
                "not signed in; run `onedrive login`",
            )
            .into());
        };
        let oauth = self.oauth_client(None, None)?;
        let config_path = self.config_path.clone();
        let provider = RefreshingTokenProvider::new(oauth, token)
            .on_token_refreshed(Arc::new(move |token: &Token| {
                if let Err(error) = persist_token(&config_path, Some(token.clone())) {
                    warn!(error = %format!("{error:#}"), "could not save refreshed token");
                }
            }));
        Ok(GraphClient::new(
            self.graph_base_url(),
            self.http_settings(),
            Arc::new(provider),
        )?)
    }
}

/// Re-reads the config and replaces only the token, so concurrent edits to
/// other fields survive.
pub(crate) fn persist_token(config_path: &std::path::Path, token: Option<Token>) -> Result<()> {
    let mut config = app_config::load_config(config_path)?;
    config.token = token;
    app_config::save_config(config_path, &config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_in(dir: &TempDir, config: AppConfig) -> AppContext {
        let config_path = dir.path().join("config.json");
        app_config::save_config(&config_path, &config).unwrap();
        AppContext::load(Some(config_path)).unwrap()
    }

    #[test]
    fn test_flag_overrides_config_retries() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(
            &dir,
            AppConfig {
                max_retries: Some(2),
                ..AppConfig::default()
            },
        );
        assert_eq!(ctx.max_retries(None), 2);
        assert_eq!(ctx.max_retries(Some(7)), 7);
    }

    #[test]
    fn test_graph_client_without_token_is_reauth() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, AppConfig::default());
        let error = ctx.graph_client().unwrap_err();
        assert_eq!(
            crate::app::exit::exit_for_error(&error),
            crate::app::exit::ProcessExit::ReauthRequired
        );
    }

    #[test]
    fn test_oauth_client_requires_client_id() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, AppConfig::default());
        assert!(ctx.oauth_client(None, None).is_err());
        assert!(ctx.oauth_client(Some("app-id"), None).is_ok());
    }

    #[test]
    fn test_persist_token_keeps_other_fields() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(
            &dir,
            AppConfig {
                client_id: Some("app-id".to_string()),
                ..AppConfig::default()
            },
        );
        let token = Token {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_at: chrono::Utc::now(),
        };
        persist_token(&ctx.config_path, Some(token.clone())).unwrap();
        let reloaded = app_config::load_config(&ctx.config_path).unwrap();
        assert_eq!(reloaded.client_id.as_deref(), Some("app-id"));
        assert_eq!(reloaded.token, Some(token));
    }
}
