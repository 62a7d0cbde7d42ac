//! # Configuration Management
//!
//! Centralized configuration for the backup server.
//!
//! ## Configuration Sources
//! - TOML files via [`BackupConfig::from_file`]
//! - Environment variables via [`BackupConfig::from_env`]
//! - The legacy `port.info` file via [`BackupConfig::with_port_file`]
//! - Direct instantiation with defaults
//!
//! Every section is `#[serde(default)]`, so a TOML file only needs the keys
//! it changes.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{warn, Level};

/// Protocol version written into every response
pub const PROTOCOL_VERSION: u8 = 3;

/// Port used when none is configured or `port.info` is unusable
pub const DEFAULT_PORT: u16 = 1256;

/// Default cap on a single request payload (64 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BackupConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BackupConfig {
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

    /// Defaults overridden by `BACKUP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `BACKUP_SERVER_HOST`, `BACKUP_SERVER_PORT` and
    /// `BACKUP_STORAGE_ROOT` on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("BACKUP_SERVER_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("BACKUP_SERVER_PORT") {
            self.server.port = port.trim().parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid BACKUP_SERVER_PORT '{port}': {e}"))
            })?;
        }

        if let Ok(root) = std::env::var("BACKUP_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }

        Ok(())
    }

    /// Take the listen port from a legacy `port.info` file.
    ///
    /// A missing or unparsable file is not an error: the default port is used
    /// and a warning logged.
    pub fn with_port_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.server.port = read_port_file(path);
        self
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
        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
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

/// Read a port number from a `port.info` style file.
pub fn read_port_file<P: AsRef<Path>>(path: P) -> u16 {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(text) => match text.trim().parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                warn!(path = %path.display(), "Unparsable port file, using default port {DEFAULT_PORT}");
                DEFAULT_PORT
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "No port file, using default port {DEFAULT_PORT}");
            DEFAULT_PORT
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    pub port: u16,

    /// Largest payload a request may declare; larger frames close the connection
    pub max_payload_size: usize,

    /// Initial per-connection read buffer
    pub read_buffer_size: usize,

    /// Connections accepted concurrently; further clients wait in the backlog
    pub max_connections: usize,

    /// Period of the metrics log line, zero disables it
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: DEFAULT_PORT,
            max_payload_size: MAX_PAYLOAD_SIZE,
            read_buffer_size: 64 * 1024,
            max_connections: 100,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("Server host cannot be empty".to_string());
        } else if self.bind_address().parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address: '{}' (expected an IP address such as '0.0.0.0')",
                self.host
            ));
        }

        if self.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }

        // Smallest useful payload is a SEND_FILE prefix (4 + 255 bytes)
        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (wire limit is 4 GiB)",
                self.max_payload_size
            ));
        }

        if self.read_buffer_size < 64 {
            errors.push("Read buffer size too small (minimum: 64 bytes)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Which [`Store`](crate::storage::Store) the server uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Directory holding uploads and the registry
    pub root: PathBuf,

    /// Registry snapshot file name, relative to `root`
    pub registry_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            root: PathBuf::from("saved"),
            registry_file: String::from("clients.db"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.backend == StorageBackend::File {
            if self.root.as_os_str().is_empty() {
                errors.push("Storage root cannot be empty".to_string());
            }
            if self.registry_file.is_empty() {
                errors.push("Registry file name cannot be empty".to_string());
            } else if self.registry_file.contains(['/', '\\']) {
                errors.push(format!(
                    "Registry file must be a plain file name: '{}'",
                    self.registry_file
                ));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(with = "log_level_serde")]
    pub level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
        }
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
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = BackupConfig::from_toml(
            r#"
            [server]
            port = 4000

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, Level::DEBUG);
        assert_eq!(config.storage.registry_file, "clients.db");
    }

    #[test]
    fn port_file_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("port.info");
        std::fs::write(&good, "8123\n").unwrap();
        assert_eq!(read_port_file(&good), 8123);

        let bad = dir.path().join("bad.info");
        std::fs::write(&bad, "not a port").unwrap();
        assert_eq!(read_port_file(&bad), DEFAULT_PORT);

        assert_eq!(read_port_file(dir.path().join("missing")), DEFAULT_PORT);
    }

    #[test]
    fn example_config_round_trips() {
        let text = BackupConfig::example_config();
        let parsed = BackupConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.server.port, DEFAULT_PORT);
        assert_eq!(parsed.storage.backend, StorageBackend::File);
    }
}
