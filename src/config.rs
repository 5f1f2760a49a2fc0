//! Configuration for the FastCGI server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::MAX_CONTENT_LEN;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(name = "fastcgi-responder")]
#[command(version = "0.1.0")]
#[command(about = "A multi-worker FastCGI responder", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., ::1 or 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to bind
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum buffered request size in bytes
    #[arg(long)]
    pub max_request_len: Option<usize>,

    /// Parameter name to retain from FCGI_PARAMS (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

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
    pub request: RequestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Live connections allowed per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: 0,
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-request limits and parameter retention
#[derive(Debug, Deserialize)]
pub struct RequestConfig {
    /// Receive buffer bound per connection
    #[serde(default = "default_max_request_len")]
    pub max_request_len: usize,
    /// Output scratch buffer per request (at most one record's content)
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Allow-list of parameter names to retain
    #[serde(default = "default_params")]
    pub params: Vec<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_request_len: default_max_request_len(),
            output_buffer: default_output_buffer(),
            params: default_params(),
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

fn default_host() -> String {
    "::1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_events_capacity() -> usize {
    256
}

fn default_max_request_len() -> usize {
    256 * 1024
}

fn default_output_buffer() -> usize {
    MAX_CONTENT_LEN
}

fn default_params() -> Vec<String> {
    [
        "REQUEST_METHOD",
        "REQUEST_URI",
        "DOCUMENT_URI",
        "QUERY_STRING",
        "CONTENT_TYPE",
        "CONTENT_LENGTH",
        "REMOTE_ADDR",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub max_request_len: usize,
    pub output_buffer: usize,
    pub params: Vec<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        Config {
            host: toml_config.server.host,
            port: toml_config.server.port,
            workers: toml_config.server.workers,
            max_connections: toml_config.server.max_connections,
            events_capacity: toml_config.server.events_capacity,
            max_request_len: toml_config.request.max_request_len,
            output_buffer: toml_config.request.output_buffer.min(MAX_CONTENT_LEN),
            params: toml_config.request.params,
            log_level: toml_config.logging.level,
        }
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut config = Self::from_toml(toml_config);
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(workers) = cli.workers {
            config.workers = workers;
        }
        if let Some(max_request_len) = cli.max_request_len {
            config.max_request_len = max_request_len;
        }
        if !cli.params.is_empty() {
            config.params = cli.params;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }
        config
    }

    /// Worker count with 0 resolved to the number of CPU cores.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "::1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, 0);
        assert_eq!(config.request.max_request_len, 256 * 1024);
        assert_eq!(config.request.output_buffer, 65535);
        assert!(config.request.params.iter().any(|p| p == "REQUEST_URI"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9100
            workers = 4

            [request]
            max_request_len = 4096
            params = ["KEY", "SCRIPT_NAME"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.request.max_request_len, 4096);
        assert_eq!(config.request.params, vec!["KEY", "SCRIPT_NAME"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "fastcgi-responder",
            "--port",
            "9200",
            "--param",
            "A",
            "--param",
            "B",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9100
            workers = 2
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9200);
        assert_eq!(config.workers, 2);
        assert_eq!(config.params, vec!["A", "B"]);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_output_buffer_clamped() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [request]
            output_buffer = 1000000
        "#,
        )
        .unwrap();
        assert_eq!(Config::from_toml(toml_config).output_buffer, MAX_CONTENT_LEN);
    }

    #[test]
    fn test_worker_count() {
        let mut config = Config::default();
        config.workers = 3;
        assert_eq!(config.worker_count(), 3);
        config.workers = 0;
        assert!(config.worker_count() >= 1);
    }
}
