//! Configuration module for byte-drain.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::{SizeUnit, Volume, DEFAULT_CHUNK_SIZE};
use crate::pool::{DEFAULT_DRAIN_GRACE, DEFAULT_POOL_SIZE};
use crate::session::DEFAULT_BUFFER_SIZE;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "byte-drain")]
#[command(author = "byte-drain authors")]
#[command(version = "0.1.0")]
#[command(about = "A point-to-point TCP byte-transfer benchmark", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and drain incoming bytes
    Server(ServerArgs),
    /// Connect to a server and push bytes
    Client(ClientArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Address to bind to (e.g., 0.0.0.0:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(short = 'w', long)]
    pub pool_size: Option<u32>,

    /// Seconds to wait in each shutdown phase
    #[arg(long)]
    pub drain_grace: Option<u64>,

    /// Per-session read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Server address to connect to
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Number of concurrent clients
    #[arg(short = 'n', long)]
    pub clients: Option<usize>,

    /// Amount to send per client, in `--unit`s
    #[arg(short = 'v', long)]
    pub volume: Option<u64>,

    /// Unit of `--volume`
    #[arg(short = 'u', long, value_enum)]
    pub unit: Option<SizeUnit>,

    /// Write chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pool_size: default_pool_size(),
            drain_grace_secs: default_drain_grace_secs(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_volume")]
    pub volume: u64,
    #[serde(default)]
    pub unit: SizeUnit,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            clients: default_clients(),
            volume: default_volume(),
            unit: SizeUnit::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "0.0.0.0:8888".to_string()
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_drain_grace_secs() -> u64 {
    DEFAULT_DRAIN_GRACE.as_secs()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_target() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_clients() -> usize {
    2
}

fn default_volume() -> u64 {
    1 // 1 GiB with the default unit
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub pool_size: u32,
    pub drain_grace: Duration,
    pub buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pool_size: DEFAULT_POOL_SIZE,
            drain_grace: DEFAULT_DRAIN_GRACE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub target: String,
    pub clients: usize,
    pub volume: Volume,
    pub chunk_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            target: default_target(),
            clients: default_clients(),
            volume: Volume::new(default_volume(), SizeUnit::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Which side of the benchmark to run
#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerSettings),
    Client(ClientSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub role: Role,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let role = match cli.command {
            Command::Server(args) => {
                let file = toml_config.server;
                let settings = ServerSettings {
                    listen: args.listen.unwrap_or(file.listen),
                    pool_size: args.pool_size.unwrap_or(file.pool_size),
                    drain_grace: Duration::from_secs(
                        args.drain_grace.unwrap_or(file.drain_grace_secs),
                    ),
                    buffer_size: args.buffer_size.unwrap_or(file.buffer_size),
                };
                if settings.pool_size == 0 {
                    return Err(ConfigError::Invalid("pool_size must be at least 1"));
                }
                if settings.buffer_size == 0 {
                    return Err(ConfigError::Invalid("buffer_size must be at least 1"));
                }
                Role::Server(settings)
            }
            Command::Client(args) => {
                let file = toml_config.client;
                let settings = ClientSettings {
                    target: args.target.unwrap_or(file.target),
                    clients: args.clients.unwrap_or(file.clients),
                    volume: Volume::new(
                        args.volume.unwrap_or(file.volume),
                        args.unit.unwrap_or(file.unit),
                    ),
                    chunk_size: args.chunk_size.unwrap_or(file.chunk_size),
                };
                if settings.clients == 0 {
                    return Err(ConfigError::Invalid("clients must be at least 1"));
                }
                if settings.chunk_size == 0 {
                    return Err(ConfigError::Invalid("chunk_size must be at least 1"));
                }
                Role::Client(settings)
            }
        };

        Ok(Config { log_level, role })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
