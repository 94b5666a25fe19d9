//! Blocksync Configuration
//!
//! Configuration structures for the blocksync replication daemon, loaded
//! from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main blocksync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksyncConfig {
    /// Replicated resource configuration
    pub resource: ResourceConfig,

    /// Remote peer configuration
    pub remote: RemoteConfig,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Block gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Replicated resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource name, must match on both nodes
    pub name: String,

    /// Backing file or device for the local component
    pub data_path: PathBuf,

    /// Directory for persisted metadata and the dirty extent map
    pub state_dir: PathBuf,

    /// Size of the exposed device in bytes
    pub media_size: u64,

    /// Size of one dirty-tracking extent in bytes
    #[serde(default = "default_extent_size")]
    pub extent_size: u64,
}

/// Remote peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Peer address (host:port)
    pub address: String,

    /// Address the secondary role accepts replication connections on
    #[serde(default = "default_remote_listen")]
    pub listen_address: String,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Fixed delay between reconnect attempts, in seconds
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of outstanding requests (request pool size)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Maximum size of a single gateway I/O in bytes
    #[serde(default = "default_max_io_size")]
    pub max_io_size: u64,
}

/// Block gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the socket gateway listens on (primary role)
    #[serde(default = "default_gateway_listen")]
    pub listen_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_extent_size() -> u64 {
    128 * 1024
}

fn default_remote_listen() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_queue_depth() -> usize {
    256
}

fn default_max_io_size() -> u64 {
    128 * 1024
}

fn default_gateway_listen() -> String {
    "127.0.0.1:7711".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_io_size: default_max_io_size(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: default_gateway_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BlocksyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.resource.name.is_empty() {
            return Err(Error::Config("resource.name must not be empty".into()));
        }
        if self.resource.media_size == 0 {
            return Err(Error::Config("resource.media_size must be non-zero".into()));
        }
        if self.resource.extent_size == 0 {
            return Err(Error::Config("resource.extent_size must be non-zero".into()));
        }
        if self.resource.extent_size > self.resource.media_size {
            return Err(Error::Config(
                "resource.extent_size must not exceed resource.media_size".into(),
            ));
        }
        if self.engine.queue_depth == 0 {
            return Err(Error::Config("engine.queue_depth must be non-zero".into()));
        }
        if self.engine.max_io_size == 0 {
            return Err(Error::Config("engine.max_io_size must be non-zero".into()));
        }
        if self.remote.address.is_empty() {
            return Err(Error::Config("remote.address must not be empty".into()));
        }
        Ok(())
    }

    /// Request payload buffer size: large enough for any gateway I/O and for
    /// one full resynchronization extent.
    pub fn buffer_size(&self) -> usize {
        self.engine.max_io_size.max(self.resource.extent_size) as usize
    }

    /// Connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }

    /// Reconnect interval as a Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.remote.reconnect_interval_secs)
    }

    /// Path of the persisted metadata document
    pub fn metadata_path(&self) -> PathBuf {
        self.resource.state_dir.join(format!("{}.meta.json", self.resource.name))
    }

    /// Path of the persisted dirty extent map
    pub fn extentmap_path(&self) -> PathBuf {
        self.resource.state_dir.join(format!("{}.extents", self.resource.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlocksyncConfig {
        toml::from_str(
            r#"
            [resource]
            name = "vol0"
            data_path = "/tmp/vol0.img"
            state_dir = "/tmp/state"
            media_size = 1048576

            [remote]
            address = "127.0.0.1:7700"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = sample();
        assert_eq!(config.resource.extent_size, 128 * 1024);
        assert_eq!(config.engine.queue_depth, 256);
        assert_eq!(config.remote.reconnect_interval_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_media_size() {
        let mut config = sample();
        config.resource.media_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_extent_larger_than_media() {
        let mut config = sample();
        config.resource.extent_size = config.resource.media_size * 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_covers_extent() {
        let mut config = sample();
        config.resource.extent_size = 512 * 1024;
        assert_eq!(config.buffer_size(), 512 * 1024);
    }
}
