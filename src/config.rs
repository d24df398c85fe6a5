//! Configuration for the coop-uring echo binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::echo::{self, ClientSettings, ServerSettings};
use crate::net::{AddrParseError, Ipv4Address, Port};
use crate::runtime::RingConfig;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of the echo exchange to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Server,
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "coop-uring")]
#[command(version = "0.1.0")]
#[command(about = "Echo server and client on a single-threaded io_uring runtime", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run the echo server or the echo client
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to listen on (server) or connect to (client)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (server) or connect to (client)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections (server)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Receive buffer size per connection in bytes
    #[serde(default = "default_server_buffer_size")]
    pub buffer_size: usize,
    /// Seconds without input before a client is disconnected
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between inactivity checks
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,
    /// Seconds between bind attempts while the address is in use
    #[serde(default = "default_bind_retry_delay")]
    pub bind_retry_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            buffer_size: default_server_buffer_size(),
            idle_timeout_secs: default_idle_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            bind_retry_delay_secs: default_bind_retry_delay(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Messages sent in order, each awaiting its echo
    #[serde(default = "echo::default_messages")]
    pub messages: Vec<String>,
    #[serde(default = "default_client_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            messages: echo::default_messages(),
            buffer_size: default_client_buffer_size(),
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

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    echo::DEFAULT_PORT
}

fn default_max_connections() -> usize {
    1024
}

fn default_server_buffer_size() -> usize {
    1024
}

fn default_client_buffer_size() -> usize {
    4096
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_idle_check_interval() -> u64 {
    3
}

fn default_bind_retry_delay() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub ring: RingConfig,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML config (CLI takes precedence).
    ///
    /// `--host` and `--port` apply to whichever side `mode` selects.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mode = cli.mode.unwrap_or(toml_config.mode);
        let TomlConfig {
            server,
            client,
            ring,
            logging,
            ..
        } = toml_config;

        let (mut server_host, mut server_port) = (server.host, server.port);
        let (mut client_host, mut client_port) = (client.host, client.port);
        match mode {
            Mode::Server => {
                server_host = cli.host.unwrap_or(server_host);
                server_port = cli.port.unwrap_or(server_port);
            }
            Mode::Client => {
                client_host = cli.host.unwrap_or(client_host);
                client_port = cli.port.unwrap_or(client_port);
            }
        }

        Ok(Config {
            mode,
            server: ServerSettings {
                host: parse_host(&server_host)?,
                port: Port(server_port),
                max_connections: cli.max_connections.unwrap_or(server.max_connections),
                buffer_size: server.buffer_size,
                idle_timeout: Duration::from_secs(server.idle_timeout_secs),
                idle_check_interval: Duration::from_secs(server.idle_check_interval_secs),
                bind_retry_delay: Duration::from_secs(server.bind_retry_delay_secs),
            },
            client: ClientSettings {
                host: parse_host(&client_host)?,
                port: Port(client_port),
                messages: client.messages,
                buffer_size: client.buffer_size,
            },
            ring,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }
}

fn parse_host(host: &str) -> Result<Ipv4Address, ConfigError> {
    Ipv4Address::parse(host).map_err(ConfigError::InvalidAddress)
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error(transparent)]
    InvalidAddress(AddrParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("coop-uring").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 56789);
        assert_eq!(config.server.idle_timeout_secs, 10);
        assert_eq!(config.client.host, "127.0.0.1");
        assert_eq!(config.client.messages.len(), 5);
        assert_eq!(config.ring.sq_entries, 1024);
        assert_eq!(config.ring.cq_entries, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            mode = "client"

            [server]
            host = "127.0.0.1"
            port = 7000
            idle_timeout_secs = 30

            [client]
            port = 7000
            messages = ["a", "bb"]

            [ring]
            sq_entries = 64
            cq_entries = 1024
            coop_taskrun = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.idle_timeout_secs, 30);
        assert_eq!(config.server.idle_check_interval_secs, 3);
        assert_eq!(config.client.messages, vec!["a", "bb"]);
        assert_eq!(config.ring.sq_entries, 64);
        assert_eq!(config.ring.cq_entries, Some(1024));
        assert!(config.ring.coop_taskrun);
        assert!(!config.ring.sqpoll);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_selected_side() {
        let config = Config::merge(
            cli(&["--mode", "client", "--host", "10.0.0.2", "--port", "9000"]),
            TomlConfig::default(),
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.client.host, Ipv4Address::parse("10.0.0.2").unwrap());
        assert_eq!(config.client.port, Port(9000));
        // Server side keeps its own settings.
        assert_eq!(config.server.host, Ipv4Address::ANY);
        assert_eq!(config.server.port, Port(56789));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_log_level_precedence() {
        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.log_level, "warn");

        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::merge(cli(&["--log-level", "trace"]), toml_config).unwrap();
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_host() {
        let err = Config::merge(cli(&["--host", "localhost"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
    }
}
