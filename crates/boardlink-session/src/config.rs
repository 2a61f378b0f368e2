//! Session configuration.
//!
//! Every field has a default, so an empty file is a valid config:
//!
//! ```toml
//! device_name = "Ash's phone"
//! scan_window_ms = 15000
//! frame_cap = 20
//! transient_status_codes = [133]
//!
//! [retry]
//! max_attempts = 5
//! settle_delay_ms = 200
//! base_backoff_ms = 500
//! attempt_timeout_ms = 10000
//! ```

use boardlink_core::ids::GATT_ERROR;
use boardlink_core::{Classifier, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name put in advertisements, if any.
    pub device_name: Option<String>,
    pub scan_window_ms: u64,
    /// Most bytes a host answers one read with; a link may allow fewer.
    pub frame_cap: usize,
    /// Upper bound on a reassembled board.
    pub max_payload_bytes: usize,
    /// Platform status codes worth retrying a connect for.
    pub transient_status_codes: Vec<u16>,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            scan_window_ms: 15_000,
            frame_cap: 20,
            max_payload_bytes: 64 * 1024,
            transient_status_codes: vec![GATT_ERROR],
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_cap == 0 {
            return Err(ConfigError::Invalid("frame_cap must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.transient_status_codes.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
