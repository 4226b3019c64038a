//! Configuration module for memcache-check.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::memcache::{CheckConfig, ConfigurationError, DEFAULT_HOST, DEFAULT_LABEL, DEFAULT_PORT};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the check runner
#[derive(Parser, Debug)]
#[command(name = "memcache-check")]
#[command(author = "memcache-check authors")]
#[command(version = "0.1.0")]
#[command(about = "Check that a memcached-compatible server is up", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host of the memcache server
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port of the memcache server
    #[arg(short, long, allow_negative_numbers = true)]
    pub port: Option<String>,

    /// Connect and read timeout in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// Label printed next to the result
    #[arg(long)]
    pub label: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub check: CheckSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Check target.
///
/// Host and port stay loosely typed so a wrong type surfaces as a
/// configuration error instead of a parse error.
#[derive(Debug, Deserialize, Default)]
pub struct CheckSection {
    pub host: Option<toml::Value>,
    pub port: Option<toml::Value>,
    pub label: Option<String>,
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Connect and read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub check: CheckConfig,
    pub label: String,
    pub timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli
            .host
            .map(toml::Value::String)
            .or(toml_config.check.host)
            .unwrap_or_else(|| toml::Value::String(DEFAULT_HOST.to_string()));
        let port = cli
            .port
            .map(toml::Value::String)
            .or(toml_config.check.port)
            .unwrap_or(toml::Value::Integer(DEFAULT_PORT));

        let timeout_ms = cli.timeout_ms.unwrap_or(toml_config.client.timeout_ms);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(Config {
            check: CheckConfig::from_values(&host, &port)?,
            label: cli
                .label
                .or(toml_config.check.label)
                .unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            timeout: Duration::from_millis(timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid check configuration: {0}")]
    Check(#[from] ConfigurationError),

    #[error("Timeout must be a positive number of milliseconds")]
    InvalidTimeout,
}
