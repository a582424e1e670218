//! Client configuration
//!
//! Central location for configuration constants, resource limits and the
//! on-disk `ClientConfig` file read at startup.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

// ===== Sync Loop =====

/// Default interval between background sync passes, in seconds
pub const SYNC_INTERVAL_SECS: u64 = 60;

/// Minimum sync interval in seconds.
/// Shorter intervals hammer the server for no benefit.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 5;

/// Maximum sync interval in seconds (1 hour)
pub const MAX_SYNC_INTERVAL_SECS: u64 = 3_600;

/// Number of remote entries re-cached after an upload pass
pub const SYNC_REFRESH_LIMIT: u32 = 200;

// ===== Deferred Deletes =====

/// Window during which a delete or discard can be undone, in milliseconds
pub const UNDO_WINDOW_MS: u64 = 5_000;

/// Maximum undo window in milliseconds (1 minute)
pub const MAX_UNDO_WINDOW_MS: u64 = 60_000;

// ===== Network =====

/// Per-request timeout for the tracker API, in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Default base URL of the tracker API
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000/api/";

// ===== Listing =====

/// Default number of entries shown on the timeline
pub const DEFAULT_TIMELINE_LIMIT: u32 = 50;

/// Upper bound on drafts returned by a draft listing
pub const DRAFT_LIST_LIMIT: u32 = 500;

// ===== Settings Keys =====

/// Settings key holding the timestamp of the last completed sync pass
pub const LAST_SYNC_SETTING: &str = "last_sync_at";

/// Environment variable overriding `server_url`
pub const SERVER_URL_ENV: &str = "GUT_SYNC_SERVER_URL";

/// Environment variable overriding `database_path`
pub const DATABASE_ENV: &str = "GUT_SYNC_DATABASE";

/// Client configuration persisted as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_undo_window")]
    pub undo_window_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_timeline_limit")]
    pub timeline_limit: u32,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("gut-tracker.db")
}

fn default_sync_interval() -> u64 {
    SYNC_INTERVAL_SECS
}

fn default_undo_window() -> u64 {
    UNDO_WINDOW_MS
}

fn default_request_timeout() -> u64 {
    REQUEST_TIMEOUT_SECS
}

fn default_timeline_limit() -> u32 {
    DEFAULT_TIMELINE_LIMIT
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            database_path: default_database_path(),
            sync_interval_secs: default_sync_interval(),
            undo_window_ms: default_undo_window(),
            request_timeout_secs: default_request_timeout(),
            timeline_limit: default_timeline_limit(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from disk, writing defaults if the file does not exist.
    /// Environment overrides are applied after the file is read.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            serde_json::from_str(&content)
                .map_err(|e| AppError::Config(format!("Failed to parse {:?}: {}", path, e)))?
        } else {
            tracing::info!("Config file not found, writing defaults to {:?}", path);
            let default = ClientConfig::default();
            default.save(path).await?;
            default
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            tracing::debug!("Server URL overridden from environment");
            self.server_url = url;
        }
        if let Ok(db) = std::env::var(DATABASE_ENV) {
            self.database_path = PathBuf::from(db);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(AppError::Config("server_url must not be empty".to_string()));
        }
        if !(MIN_SYNC_INTERVAL_SECS..=MAX_SYNC_INTERVAL_SECS).contains(&self.sync_interval_secs) {
            return Err(AppError::Config(format!(
                "sync_interval_secs must be between {} and {}",
                MIN_SYNC_INTERVAL_SECS, MAX_SYNC_INTERVAL_SECS
            )));
        }
        if self.undo_window_ms > MAX_UNDO_WINDOW_MS {
            return Err(AppError::Config(format!(
                "undo_window_ms must not exceed {}",
                MAX_UNDO_WINDOW_MS
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.timeline_limit == 0 {
            return Err(AppError::Config(
                "timeline_limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn undo_window(&self) -> Duration {
        Duration::from_millis(self.undo_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_defaults_written_on_first_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");

        let config = ClientConfig::load(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(config.sync_interval_secs, SYNC_INTERVAL_SECS);
        assert_eq!(config.undo_window(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_missing_fields_use_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{ "sync_interval_secs": 30 }"#).await.unwrap();

        let config = ClientConfig::load(&path).await.unwrap();

        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.timeline_limit, DEFAULT_TIMELINE_LIMIT);
        assert_eq!(config.request_timeout_secs, REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_validate_rejects_out_of_range_interval() {
        let config = ClientConfig {
            sync_interval_secs: 1,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let config = ClientConfig {
            undo_window_ms: MAX_UNDO_WINDOW_MS + 1,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "not json").await.unwrap();

        let result = ClientConfig::load(&path).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
