//! Configuration module for memprobe.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::validate_key;
use crate::report::ReportFormat;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the probe service
#[derive(Parser, Debug)]
#[command(name = "memprobe")]
#[command(author = "memprobe authors")]
#[command(version = "0.1.0")]
#[command(about = "Fires concurrent memcached lookups on demand", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Memcached server to probe (e.g., 127.0.0.1:11211)
    #[arg(short = 's', long)]
    pub cache_server: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub cache: CacheConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Memcached client configuration
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Address of the memcached server
    #[serde(default = "default_cache_server")]
    pub server: String,
    /// Maximum number of open connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            server: default_cache_server(),
            pool_size: default_pool_size(),
        }
    }
}

/// Fan-out probe configuration
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    /// Key every lookup fetches
    #[serde(default = "default_key")]
    pub key: String,
    /// Per-lookup deadline in seconds
    #[serde(default = "default_deadline")]
    pub deadline: u64,
    /// Largest accepted count
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    /// Optional cap on lookups outstanding at once
    pub max_in_flight: Option<usize>,
    /// Default response format
    #[serde(default)]
    pub report: ReportFormat,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            deadline: default_deadline(),
            max_count: default_max_count(),
            max_in_flight: None,
            report: ReportFormat::default(),
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
    "127.0.0.1:8080".to_string()
}

fn default_cache_server() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_pool_size() -> usize {
    32
}

fn default_key() -> String {
    "roger".to_string()
}

fn default_deadline() -> u64 {
    30 // 30 seconds
}

fn default_max_count() -> usize {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub cache_server: String,
    pub pool_size: usize,
    pub key: String,
    pub deadline: Duration,
    pub max_count: usize,
    pub max_in_flight: Option<usize>,
    pub report: ReportFormat,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            cache,
            probe,
            logging,
        } = toml_config;

        if !validate_key(&probe.key) {
            return Err(ConfigError::InvalidKey(probe.key));
        }
        if cache.pool_size == 0 {
            return Err(ConfigError::Invalid("cache.pool_size must be at least 1"));
        }
        if probe.max_count == 0 {
            return Err(ConfigError::Invalid("probe.max_count must be at least 1"));
        }
        if probe.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid("probe.max_in_flight must be at least 1"));
        }

        let workers = cli.workers.or(server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers must be at least 1"));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(server.listen),
            cache_server: cli.cache_server.unwrap_or(cache.server),
            pool_size: cache.pool_size,
            key: probe.key,
            deadline: Duration::from_secs(probe.deadline),
            max_count: probe.max_count,
            max_in_flight: probe.max_in_flight,
            report: probe.report,
            workers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidKey(String),
    Invalid(&'static str),
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
            ConfigError::InvalidKey(key) => write!(f, "Invalid cache key: {:?}", key),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["memprobe"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.cache.server, "127.0.0.1:11211");
        assert_eq!(config.probe.key, "roger");
        assert_eq!(config.probe.deadline, 30);
        assert_eq!(config.probe.report, ReportFormat::Ok);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [cache]
            server = "10.0.0.5:11211"
            pool_size = 8

            [probe]
            key = "probe-key"
            deadline = 5
            max_count = 500
            max_in_flight = 64
            report = "latencies"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.cache.server, "10.0.0.5:11211");
        assert_eq!(config.cache.pool_size, 8);
        assert_eq!(config.probe.key, "probe-key");
        assert_eq!(config.probe.deadline, 5);
        assert_eq!(config.probe.max_count, 500);
        assert_eq!(config.probe.max_in_flight, Some(64));
        assert_eq!(config.probe.report, ReportFormat::Latencies);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [cache]
            server = "10.0.0.5:11211"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-l", "127.0.0.1:7000", "--log-level", "trace"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.cache_server, "10.0.0.5:11211");
        assert_eq!(config.deadline, Duration::from_secs(30));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_key_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.probe.key = "has space".to_string();
        match Config::merge(cli(&[]), toml_config) {
            Err(ConfigError::InvalidKey(key)) => assert_eq!(key, "has space"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.cache.pool_size = 0;
        assert!(matches!(
            Config::merge(cli(&[]), toml_config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let toml_config: TomlConfig = toml::from_str("[server]\nworkers = 0\n").unwrap();
        match Config::merge(cli(&[]), toml_config) {
            Err(ConfigError::Invalid(msg)) => assert_eq!(msg, "server.workers must be at least 1"),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            Config::merge(cli(&["-w", "0"]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
        let config = Config::merge(cli(&["-w", "2"]), TomlConfig::default()).unwrap();
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn test_zero_max_count_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.probe.max_count = 0;
        match Config::merge(cli(&[]), toml_config) {
            Err(ConfigError::Invalid(msg)) => assert_eq!(msg, "probe.max_count must be at least 1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_zero_max_in_flight_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.probe.max_in_flight = Some(0);
        match Config::merge(cli(&[]), toml_config) {
            Err(ConfigError::Invalid(msg)) => {
                assert_eq!(msg, "probe.max_in_flight must be at least 1")
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut toml_config = TomlConfig::default();
        toml_config.probe.max_in_flight = Some(1);
        assert_eq!(
            Config::merge(cli(&[]), toml_config).unwrap().max_in_flight,
            Some(1)
        );
    }
}
