//! Configuration shared by the timer service and the client proxy
//!
//! Resolution order: defaults, then an optional TOML file, then the
//! `DEBOUNCED_*` environment variables. Command-line flags are applied on top
//! by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Socket path used when nothing else is configured
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/app.debounceEvents";

/// Default wait/retry interval in seconds
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 3.0;

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "DEBOUNCED_SOCKET";

/// Environment variable overriding the wait interval (seconds)
pub const TIMEOUT_ENV: &str = "DEBOUNCED_TIMEOUT";

/// Shortest wait interval honoured, keeps idle loops from spinning
const MIN_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Longest wait interval accepted (one day)
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for one service/proxy pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Filesystem path of the service socket
    pub socket_path: PathBuf,

    /// Retry interval and read timeout, in seconds
    pub wait_timeout_secs: f64,

    /// Largest accepted frame
    pub max_frame_bytes: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl DebounceConfig {
    /// Defaults with a specific socket path
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    pub fn with_wait_timeout(mut self, wait: Duration) -> Self {
        self.wait_timeout_secs = wait.as_secs_f64();
        self
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Apply `DEBOUNCED_SOCKET` / `DEBOUNCED_TIMEOUT` through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(SOCKET_ENV).filter(|p| !p.is_empty()) {
            self.socket_path = PathBuf::from(path);
        }

        if let Some(raw) = lookup(TIMEOUT_ENV) {
            self.wait_timeout_secs = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a number of seconds, got '{}'", TIMEOUT_ENV, raw))
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.wait_timeout_secs.is_finite() || self.wait_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "wait_timeout_secs must be positive, got {}",
                self.wait_timeout_secs
            )));
        }
        if self.wait_timeout_secs > MAX_WAIT_TIMEOUT.as_secs_f64() {
            return Err(ConfigError::Invalid(format!(
                "wait_timeout_secs must be at most {}, got {}",
                MAX_WAIT_TIMEOUT.as_secs(),
                self.wait_timeout_secs
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be > 0".to_string()));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path is empty".to_string()));
        }
        Ok(())
    }

    /// Wait/retry interval, also the receive loop's read timeout
    pub fn wait_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.wait_timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_WAIT_TIMEOUT_SECS))
            .clamp(MIN_WAIT_TIMEOUT, MAX_WAIT_TIMEOUT)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
