//! Client configuration
//!
//! Loaded from TOML, then overridden by `CREDITSYNC_*` environment variables.
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Directory holding the RocksDB store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// User whose balance this client mirrors
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// First retry delay after a transient failure (ms)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling (ms)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Timeout for one remote call (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Transient failures tolerated per queue entry before it is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How often the reconciler re-checks the queue while online (ms)
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Settled replays kept in the history log
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of the balance and failure broadcast channels
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_sync_interval_ms() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    500
}

fn default_event_buffer() -> usize {
    64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            user_id: default_user_id(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            sync_interval_ms: default_sync_interval_ms(),
            history_limit: default_history_limit(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ClientConfig {
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn from_toml_str(s: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> SyncResult<()> {
        if let Ok(dir) = std::env::var("CREDITSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(user) = std::env::var("CREDITSYNC_USER_ID") {
            self.user_id = user;
        }
        if let Ok(raw) = std::env::var("CREDITSYNC_MAX_ATTEMPTS") {
            self.max_attempts = raw.parse().map_err(|_| {
                SyncError::Config(format!("CREDITSYNC_MAX_ATTEMPTS is not a number: {}", raw))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.backoff_base_ms == 0 {
            return Err(SyncError::Config("backoff_base_ms must be > 0".to_string()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(SyncError::Config(
                "backoff_max_ms must be >= backoff_base_ms".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be > 0".to_string()));
        }
        if self.request_timeout_ms == 0 || self.sync_interval_ms == 0 {
            return Err(SyncError::Config(
                "request_timeout_ms and sync_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}
