//! Configuration management for the IPC layer.
//!
//! Settings are loaded from a TOML file and split into the logging sink,
//! the protocol defaults applied to every new connection context, and the
//! rendezvous socket used by servers and clients.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Highest error source tag that fits the 7-bit source field.
pub const MAX_ERROR_SOURCE: u8 = 127;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Logging sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON records instead of human readable lines
    #[serde(default)]
    pub json_format: bool,

    /// Also write to a daily rolling file
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Base file name for rolling log files
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file_name() -> String {
    "assuan".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            json_format: false,
            log_to_file: false,
            log_dir: default_log_dir(),
            log_file_name: default_log_file_name(),
        }
    }
}

/// Process-wide protocol defaults and the flags every new context starts with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Prefix prepended to every logged protocol line
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// Error source tag used when composing error values (0..=127)
    #[serde(default = "default_error_source")]
    pub error_source: u8,

    /// Forward `#` comment lines to the client status callback
    #[serde(default)]
    pub convey_comments: bool,

    /// Never log protocol lines
    #[serde(default)]
    pub no_logging: bool,

    /// Leave reaping of spawned servers to the caller
    #[serde(default)]
    pub no_waitpid: bool,

    /// Do not ignore SIGPIPE when connecting to a child
    #[serde(default)]
    pub no_fixsignals: bool,

    /// Upper bound for a single inquire reply in bytes (0 = unlimited)
    #[serde(default)]
    pub max_inquire_len: usize,
}

fn default_log_prefix() -> String {
    "assuan".to_string()
}

fn default_error_source() -> u8 {
    // GPG_ERR_SOURCE_ASSUAN
    15
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            log_prefix: default_log_prefix(),
            error_source: default_error_source(),
            convey_comments: false,
            no_logging: false,
            no_waitpid: false,
            no_fixsignals: false,
            max_inquire_len: 0,
        }
    }
}

/// Rendezvous socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SocketConfig {
    /// Path of the socket (or nonce file when emulated)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Use the loopback TCP + nonce file emulation instead of a Unix socket
    #[serde(default)]
    pub emulate: bool,

    /// Allow descriptor passing over the socket; ignored when emulated
    #[serde(default = "default_true")]
    pub fd_passing: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            path: None,
            emulate: false,
            fd_passing: true,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Logging sink configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol defaults
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Rendezvous socket configuration
    #[serde(default)]
    pub socket: SocketConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            protocol: ProtocolConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "log_level".to_string(),
                    message: format!("unknown level '{}'", other),
                });
            }
        }

        if self.protocol.error_source > MAX_ERROR_SOURCE {
            return Err(ConfigError::InvalidValue {
                key: "protocol.error_source".to_string(),
                message: format!("must be at most {}", MAX_ERROR_SOURCE),
            });
        }

        if self.protocol.log_prefix.contains(['\n', '\r']) {
            return Err(ConfigError::InvalidValue {
                key: "protocol.log_prefix".to_string(),
                message: "must not contain line breaks".to_string(),
            });
        }

        if let Some(path) = &self.socket.path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingValue("socket.path".to_string()));
            }
        }

        Ok(())
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("assuan").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Save the current configuration to a new path
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.config.save(path)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.protocol.log_prefix, "assuan");
        assert_eq!(config.protocol.error_source, 15);
        assert!(config.socket.fd_passing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "debug"

            [logging]
            json_format = true

            [protocol]
            log_prefix = "agent"
            error_source = 4
            convey_comments = true
            max_inquire_len = 4096

            [socket]
            path = "/run/user/1000/agent.sock"
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.logging.log_file_name, "assuan");
        assert_eq!(config.protocol.log_prefix, "agent");
        assert_eq!(config.protocol.error_source, 4);
        assert!(config.protocol.convey_comments);
        assert!(!config.protocol.no_waitpid);
        assert_eq!(config.protocol.max_inquire_len, 4096);
        assert_eq!(
            config.socket.path,
            Some(PathBuf::from("/run/user/1000/agent.sock"))
        );
        assert!(config.socket.fd_passing);
    }

    #[test]
    fn test_save_config() {
        let mut config = Config::default();
        config.log_level = "warn".to_string();
        config.protocol.no_logging = true;
        config.socket.path = Some(PathBuf::from("/tmp/s.sock"));

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.protocol.error_source = 200;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.socket.emulate = true;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.socket.path = Some(PathBuf::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/assuan.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_config_manager() {
        let file = NamedTempFile::new().unwrap();
        Config::default().save(file.path()).unwrap();

        let mut manager = ConfigManager::load(file.path()).unwrap();
        manager.config_mut().protocol.log_prefix = "gpgsm".to_string();
        manager.save().unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.config().protocol.log_prefix, "gpgsm");
        assert_eq!(manager.config_path(), file.path());
    }
}
