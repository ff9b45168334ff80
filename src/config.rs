//! Configuration module for the server binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::responder::Responder;
use crate::server::ServerOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "oneshot-server")]
#[command(version)]
#[command(about = "A TCP server answering one request per connection", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-connection receive buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrently served clients
    #[arg(short, long)]
    pub max_clients: Option<usize>,

    /// Bind to loopback only (true) or all interfaces (false)
    #[arg(long)]
    pub local_only: Option<bool>,

    /// Built-in request handler
    #[arg(short, long, value_enum)]
    pub responder: Option<Responder>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_local_only")]
    pub local_only: bool,
    #[serde(default)]
    pub responder: Responder,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            buffer_size: default_buffer_size(),
            max_clients: default_max_clients(),
            local_only: default_local_only(),
            responder: Responder::default(),
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

fn default_port() -> u16 {
    8080
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_clients() -> usize {
    16
}

fn default_local_only() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub buffer_size: usize,
    pub max_clients: usize,
    pub local_only: bool,
    pub responder: Responder,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            port: cli.port.unwrap_or(server.port),
            buffer_size: cli.buffer_size.unwrap_or(server.buffer_size),
            max_clients: cli.max_clients.unwrap_or(server.max_clients),
            local_only: cli.local_only.unwrap_or(server.local_only),
            responder: cli.responder.unwrap_or(server.responder),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            port: self.port,
            buffer_size: self.buffer_size,
            max_clients: self.max_clients,
            local_only: self.local_only,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
