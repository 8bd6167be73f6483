//! Configuration module for the gateway.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::DEFAULT_MAX_BODY_LEN;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the gateway
#[derive(Parser, Debug)]
#[command(name = "framegate")]
#[command(author = "framegate authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-threaded TCP message gateway", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:10086)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of I/O worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of task pool threads (0 = number of CPU cores)
    #[arg(long)]
    pub task_threads: Option<usize>,

    /// Maximum accepted message body length in bytes (up to 65535)
    #[arg(long)]
    pub max_body_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of I/O worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Number of task pool threads (0 = number of CPU cores)
    #[serde(default)]
    pub task_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            task_threads: 0,
        }
    }
}

/// Wire-protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum accepted message body length in bytes
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_body_len: default_max_body_len(),
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

fn default_listen() -> String {
    "127.0.0.1:10086".to_string()
}

fn default_max_body_len() -> usize {
    DEFAULT_MAX_BODY_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub task_threads: usize,
    pub max_body_len: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            task_threads: cli
                .task_threads
                .unwrap_or(toml_config.server.task_threads),
            max_body_len: cli
                .max_body_len
                .unwrap_or(toml_config.protocol.max_body_len),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        // The body length field on the wire is 2 bytes; a larger limit can
        // never be exercised and indicates a misconfiguration.
        if config.max_body_len > u16::MAX as usize {
            return Err(ConfigError::BodyLimitTooLarge(config.max_body_len));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BodyLimitTooLarge(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::BodyLimitTooLarge(limit) => {
                write!(
                    f,
                    "max_body_len {} exceeds the wire format maximum {}",
                    limit,
                    u16::MAX
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:10086");
        assert_eq!(config.server.workers, 0);
        assert_eq!(config.protocol.max_body_len, DEFAULT_MAX_BODY_LEN);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:10086"
            workers = 4
            task_threads = 2

            [protocol]
            max_body_len = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:10086");
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.task_threads, 2);
        assert_eq!(config.protocol.max_body_len, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("[server]\nworkers = 8\n").unwrap();
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.server.listen, "127.0.0.1:10086");
        assert_eq!(config.protocol.max_body_len, DEFAULT_MAX_BODY_LEN);
    }
}
