//! Configuration management for mongodump
//!
//! This module handles loading, parsing, and managing configuration from:
//! - Configuration files (TOML format)
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Configuration file
//! 3. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Dump pipeline configuration
    #[serde(default)]
    pub dump: DumpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default MongoDB connection URI
    #[serde(default = "default_uri")]
    pub default_uri: String,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Settings for the per-collection read/write pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Output directory used when `--out` is not given
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Number of documents buffered between the cursor reader and the writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Cursor batch size requested when prefetching
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Size of the buffered writer in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Show a progress spinner per collection
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_app_name() -> String {
    "mongodump".to_string()
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("dump")
}

fn default_queue_capacity() -> usize {
    64
}

fn default_batch_size() -> u32 {
    1000
}

fn default_write_buffer_size() -> usize {
    8 * 1024 * 1024
}

fn default_show_progress() -> bool {
    true
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_uri: default_uri(),
            timeout: default_timeout(),
            app_name: default_app_name(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            write_buffer_size: default_write_buffer_size(),
            show_progress: default_show_progress(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Load configuration from a file, falling back to defaults
    ///
    /// With an explicit path the file must exist. Without one the default
    /// location is tried and a missing file yields the default configuration.
    ///
    /// # Arguments
    /// * `path` - Optional path to a TOML configuration file
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_config_path(), false),
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            ConfigError::InvalidFormat(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mongodump")
            .join("config.toml")
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        if self.dump.queue_capacity == 0 {
            return Err(invalid("dump.queue_capacity", "0"));
        }
        if self.dump.batch_size == 0 {
            return Err(invalid("dump.batch_size", "0"));
        }
        if self.dump.write_buffer_size == 0 {
            return Err(invalid("dump.write_buffer_size", "0"));
        }
        if self.connection.timeout == 0 {
            return Err(invalid("connection.timeout", "0"));
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout)
    }
}

fn invalid(field: &str, value: &str) -> crate::error::DumpError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
