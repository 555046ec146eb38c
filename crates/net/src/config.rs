//! Broadcaster configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//!
//! ```toml
//! listen = "0.0.0.0:12800"
//! replay_capacity = 4096
//! idle_room_grace_ms = 60000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::DEFAULT_PORT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BroadcasterConfig {
    /// Address the server binds to
    pub listen: SocketAddr,
    /// Committed commands kept per room for late joiners
    pub replay_capacity: usize,
    /// How long an empty room keeps its replay buffer and sequence counter
    pub idle_room_grace_ms: u64,
    /// Expected client heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Silence after which a session is considered dead
    pub heartbeat_timeout_ms: u64,
    /// Per-session outbound queue; a member that fills it is evicted
    pub outbound_queue: usize,
    pub max_frame_size: u32,
    /// How often idle rooms are checked for expiry
    pub reap_interval_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            replay_capacity: 1024,
            idle_room_grace_ms: 30_000,
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 10_000,
            outbound_queue: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reap_interval_ms: 1_000,
        }
    }
}

impl BroadcasterConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_capacity == 0 {
            return Err(ConfigError::Invalid("replay_capacity must be > 0".into()));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("outbound_queue must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.reap_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat and reap intervals must be > 0".into(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if (self.max_frame_size as usize) <= crate::frame::HEADER_SIZE {
            return Err(ConfigError::Invalid("max_frame_size is too small".into()));
        }
        Ok(())
    }

    pub fn idle_room_grace(&self) -> Duration {
        Duration::from_millis(self.idle_room_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}
