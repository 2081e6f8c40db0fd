//! Configuration file and logging setup.
//!
//! ```toml
//! [protocol]
//! software = "cirrus-core 0.3.0"
//! protocols = [1]
//! features = ["plaintext"]
//! ping_timeout = 60
//!
//! [logging]
//! level = "info"
//!
//! [[shares]]
//! path = "/srv/photos"
//! dbpath = "/var/lib/cirrus/photos.db"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// What this node announces to peers
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shares attached at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shares: Vec<ShareConfig>,
}

/// Protocol identity and capabilities, shared by every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Software name and version sent in greetings
    #[serde(default = "default_software")]
    pub software: String,
    /// Supported protocol versions
    #[serde(default = "default_protocols")]
    pub protocols: Vec<u32>,
    /// Optional features offered to peers
    #[serde(default)]
    pub features: Vec<String>,
    /// This node's peer identifier
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Keepalive timeout announced in pings (seconds)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A share to attach at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share root directory
    pub path: PathBuf,
    /// Database location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbpath: Option<PathBuf>,
}

// Default values

fn default_software() -> String {
    format!("cirrus-core {}", env!("CARGO_PKG_VERSION"))
}

fn default_protocols() -> Vec<u32> {
    vec![crate::PROTOCOL_VERSION]
}

fn default_peer_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn default_ping_timeout() -> u32 {
    crate::message::DEFAULT_PING_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            software: default_software(),
            protocols: default_protocols(),
            features: Vec::new(),
            peer_id: default_peer_id(),
            ping_timeout: default_ping_timeout(),
        }
    }
}

impl ProtocolConfig {
    /// Check that the values can drive a session
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.software.trim().is_empty() {
            return Err(ConfigError::Invalid("software must not be empty".into()));
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one protocol version is required".into(),
            ));
        }
        if self.protocols.contains(&0) {
            return Err(ConfigError::Invalid("protocol version 0 is reserved".into()));
        }
        if self.peer_id.trim().is_empty() {
            return Err(ConfigError::Invalid("peer_id must not be empty".into()));
        }
        if self.ping_timeout == 0 {
            return Err(ConfigError::Invalid("ping_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Whether a feature is offered
    #[must_use]
    pub fn offers(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber.
    ///
    /// Returns false if a subscriber was already installed.
    pub fn init(&self) -> bool {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_err)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        if EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ConfigError::Invalid(
                format!("invalid log level: {}", self.logging.level).into(),
            ));
        }
        Ok(())
    }
}
