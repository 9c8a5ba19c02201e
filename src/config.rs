//! # Configuration Management
//!
//! Centralized configuration for the internode messaging layer.
//!
//! This module holds the protocol constants shared by both ends of a
//! connection and the structured configuration for a node's messaging
//! service and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`INTERNODE_*`)

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// First protocol version.
pub const VERSION_1: i32 = 1;

/// Adds the optional replication name to update packets.
pub const VERSION_2: i32 = 2;

/// Highest protocol version this node speaks.
pub const CURRENT_VERSION: i32 = VERSION_2;

/// Magic number opening the connection preamble and every message frame.
pub const PROTOCOL_MAGIC: i32 = 0xCA55_2DFA_u32 as i32;

/// Seed of the streaming xxh32 checksum used by compressed connections.
pub const LZ4_HASH_SEED: u32 = 0x9747_B28C;

/// Max allowed frame payload size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Name of the savepoint pushed for nested transactions.
pub const INTERNAL_SAVEPOINT: &str = "_INTERNAL_SAVEPOINT_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClusterConfig {
    /// Internode messaging configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("INTERNODE_LISTEN_ADDRESS") {
            config.messaging.listen_address = addr;
        }

        if let Ok(mode) = std::env::var("INTERNODE_COMPRESSION") {
            config.messaging.internode_compression = match mode.to_ascii_lowercase().as_str() {
                "all" => InternodeCompression::All,
                "none" => InternodeCompression::None,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid INTERNODE_COMPRESSION value: '{other}' (expected 'all' or 'none')"
                    )))
                }
            };
        }

        if let Ok(flag) = std::env::var("INTERNODE_CROSS_NODE_TIMEOUT") {
            if let Ok(val) = flag.parse::<bool>() {
                config.messaging.cross_node_timeout = val;
            }
        }

        if let Ok(timeout) = std::env::var("INTERNODE_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.messaging.request_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("INTERNODE_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.messaging.connect_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.messaging.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Which internode connections are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InternodeCompression {
    /// Every outbound connection asks for the LZ4 block stream
    All,
    /// Plain buffered streams
    #[default]
    None,
}

/// Internode messaging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Address the node listens on for internode connections
    pub listen_address: String,

    /// Compression policy for outbound connections
    pub internode_compression: InternodeCompression,

    /// Reconcile sender timestamps and drop requests that are already too old
    pub cross_node_timeout: bool,

    /// How long a caller waits for an acknowledgement
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Timeout for establishing an outbound connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Interval of the sweep that expires abandoned callbacks
    #[serde(with = "duration_serde")]
    pub callback_expiry_interval: Duration,

    /// Largest accepted frame payload
    pub max_frame_size: usize,

    /// Timeout for graceful shutdown of connection loops
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            listen_address: String::from("127.0.0.1:7000"),
            internode_compression: InternodeCompression::None,
            cross_node_timeout: false,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            callback_expiry_interval: Duration::from_secs(1),
            max_frame_size: MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl MessagingConfig {
    /// Whether outbound connections should ask for compression
    pub fn compress_outbound(&self) -> bool {
        self.internode_compression == InternodeCompression::All
    }

    /// Validate messaging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_address.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected format: '0.0.0.0:7000')",
                self.listen_address
            ));
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        } else if self.request_timeout.as_secs() > 3600 {
            errors.push("Request timeout too long (maximum: 1 hour)".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.callback_expiry_interval.as_millis() < 10 {
            errors.push("Callback expiry interval too short (minimum: 10ms)".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("internode"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
