//! Session settings read from an optional `config.toml`
//!
//! Every key may be omitted; missing keys take the defaults below.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_EVENT_CAPACITY, DEFAULT_SETTLE_DELAY_MS};

/// Channel session settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before a channel that is already open at wrap time is reported OPEN.
    /// Some primitives report ready before the first send is safe.
    pub settle_delay_ms: u64,
    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
    /// Remove sessions from the registry once they report CLOSED
    pub drop_closed_sessions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            drop_closed_sessions: true,
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Load from the platform config file, falling back to defaults
    ///
    /// Unreadable or invalid files are logged and ignored.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            debug!("No config directory, using session defaults");
            return Self::default();
        };

        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("Ignoring session config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No session config at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e.to_string())),
        };

        let config = Self::from_toml(&content)?;
        info!(
            "Session config from {}: settle {}ms, event capacity {}",
            path.display(),
            config.settle_delay_ms,
            config.event_capacity
        );
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `config.toml` in the platform config directory for peerlink
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "peerlink", "peerlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}
