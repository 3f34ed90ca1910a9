//! Session configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables shared by host and guest.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often a connected client sends `Ping`.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is considered gone.
    pub heartbeat_timeout_ms: u64,
    /// Backstop poll of the inbound queue.
    pub forced_poll_ms: u64,
    /// Messages buffered per peer before new ones are dropped.
    pub outbound_queue_capacity: usize,
    pub bind_address: IpAddr,
    /// Where project snapshots are written.
    pub temp_dir: PathBuf,
    pub application_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 10_000,
            forced_poll_ms: 1_000,
            outbound_queue_capacity: 1024,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            temp_dir: std::env::temp_dir().join("reelsync"),
            application_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 || self.forced_poll_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_queue_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn forced_poll(&self) -> Duration {
        Duration::from_millis(self.forced_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml("heartbeat_timeout_ms = 3000\n").unwrap();
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.outbound_queue_capacity, 1024);
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let err = SessionConfig::from_toml("heartbeat_interval_ms = 500\nheartbeat_timeout_ms = 500\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_file_is_a_read_error() {
        let err = SessionConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
