//! JSON configuration file: application registration, stored token, and
//! transfer defaults.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use onedrive_core::Token;
use onedrive_core::transfer::{MAX_UPLOAD_CHUNK_SIZE, UPLOAD_CHUNK_ALIGNMENT};
use serde::{Deserialize, Serialize};

const CONFIG_DIR_NAME: &str = "onedrive";
const CONFIG_FILE_NAME: &str = "config.json";
const SESSIONS_DIR_NAME: &str = "sessions";

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Azure application (client) id used for OAuth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Tenant segment of the OAuth endpoints (`common` when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Token saved by `login` and updated on every refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    /// Directory for transfer session records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
    /// HTTP connect timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    /// Whole-request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    /// Upload chunk size in bytes (multiple of 327680).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_chunk_size: Option<u64>,
    /// Download range size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_chunk_size: Option<u64>,
    /// Retries per chunk for transient failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// How long an interrupted download stays resumable, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_session_ttl_secs: Option<u64>,
    /// Graph root URL override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_base_url: Option<String>,
    /// Identity platform authority override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_base_url: Option<String>,
}

impl AppConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("request_timeout_secs", self.request_timeout_secs)?;
        validate_upload_chunk_size(self.upload_chunk_size)?;

        if let Some(size) = self.download_chunk_size
            && !(UPLOAD_CHUNK_ALIGNMENT..=MAX_UPLOAD_CHUNK_SIZE).contains(&size)
        {
            bail!(
                "Invalid config value for `download_chunk_size`: {size}. Expected range: {UPLOAD_CHUNK_ALIGNMENT}..={MAX_UPLOAD_CHUNK_SIZE}"
            );
        }
        if let Some(retries) = self.max_retries
            && retries > 10
        {
            bail!("Invalid config value for `max_retries`: {retries}. Expected range: 0..=10");
        }
        if let Some(ttl) = self.download_session_ttl_secs
            && !(60..=86_400).contains(&ttl)
        {
            bail!(
                "Invalid config value for `download_session_ttl_secs`: {ttl}. Expected range: 60..=86400"
            );
        }
        if let Some(client_id) = &self.client_id
            && client_id.trim().is_empty()
        {
            bail!("Invalid config value for `client_id`: must not be empty");
        }
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Shared by the config file and the `--chunk-size` flag.
pub fn validate_upload_chunk_size(value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value == 0 || value % UPLOAD_CHUNK_ALIGNMENT != 0 || value > MAX_UPLOAD_CHUNK_SIZE {
        bail!(
            "Invalid upload chunk size {value}: must be a multiple of {UPLOAD_CHUNK_ALIGNMENT} between {UPLOAD_CHUNK_ALIGNMENT} and {MAX_UPLOAD_CHUNK_SIZE}"
        );
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/onedrive/config.json`
/// 2. `$HOME/.config/onedrive/config.json`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Sessions directory: the configured one, else `sessions/` next to the config file.
#[must_use]
pub fn resolve_sessions_dir(config: &AppConfig, config_path: &Path) -> PathBuf {
    if let Some(dir) = &config.sessions_dir {
        return dir.clone();
    }
    config_path
        .parent()
        .map_or_else(|| PathBuf::from(SESSIONS_DIR_NAME), |p| p.join(SESSIONS_DIR_NAME))
}

/// Loads and validates the config; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read config file '{}'", path.display()));
        }
    };
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file '{}'", path.display()))?;
    Ok(config)
}

/// Writes the config atomically, readable by the owner only.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory '{}'", dir.display()))?;

    let bytes = serde_json::to_vec_pretty(config).context("Failed to encode config")?;
    let temp = dir.join(format!(".{CONFIG_FILE_NAME}.tmp-{}", std::process::id()));
    let result = write_owner_only(&temp, &bytes).and_then(|()| {
        fs::rename(&temp, path)
            .with_context(|| format!("Failed to replace config file '{}'", path.display()))
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write '{}'", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_keeps_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = AppConfig {
            client_id: Some("app-id".to_string()),
            token: Some(Token {
                access_token: "at".to_string(),
                refresh_token: Some("rt".to_string()),
                expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            }),
            max_retries: Some(4),
            ..AppConfig::default()
        };
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        save_config(&path, &AppConfig::default()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            r#"{"connect_timeout_secs":0}"#,
            r#"{"request_timeout_secs":3601}"#,
            r#"{"upload_chunk_size":1000}"#,
            r#"{"upload_chunk_size":0}"#,
            r#"{"download_chunk_size":10}"#,
            r#"{"max_retries":11}"#,
            r#"{"download_session_ttl_secs":5}"#,
            r#"{"client_id":"  "}"#,
        ];
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        for raw in cases {
            fs::write(&path, raw).unwrap();
            let error = load_config(&path).unwrap_err();
            assert!(format!("{error:#}").contains("Invalid"), "{raw}: {error:#}");
        }
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        let error = load_config(&path).unwrap_err();
        assert!(format!("{error:#}").contains("Failed to parse"));
    }

    #[test]
    fn test_sessions_dir_defaults_next_to_config() {
        let config = AppConfig::default();
        assert_eq!(
            resolve_sessions_dir(&config, Path::new("/home/u/.config/onedrive/config.json")),
            PathBuf::from("/home/u/.config/onedrive/sessions")
        );
        let custom = AppConfig {
            sessions_dir: Some(PathBuf::from("/var/tmp/od")),
            ..AppConfig::default()
        };
        assert_eq!(
            resolve_sessions_dir(&custom, Path::new("/x/config.json")),
            PathBuf::from("/var/tmp/od")
        );
    }
}
