//! Configuration module for the Gemini server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::tls::TlsSettings;

/// Command-line arguments for the Gemini server
#[derive(Parser, Debug)]
#[command(name = "gemini-server")]
#[command(version)]
#[command(about = "A Gemini protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Server port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server hostname, reported as SERVER_NAME and used to reject proxy requests
    #[arg(long)]
    pub hostname: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of async worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of threads running application code
    #[arg(long)]
    pub blocking_threads: Option<usize>,

    /// Seconds to wait for the request line (0 = wait forever)
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Server TLS certificate file (an ad-hoc certificate is generated if unset)
    #[arg(long = "tls-certfile", value_name = "FILE")]
    pub certfile: Option<PathBuf>,

    /// Server TLS private key file (defaults to the certificate file)
    #[arg(long = "tls-keyfile", value_name = "FILE")]
    pub keyfile: Option<PathBuf>,

    /// A CA file to use for validating clients
    #[arg(long = "tls-cafile", value_name = "FILE")]
    pub cafile: Option<PathBuf>,

    /// A directory containing CA files for validating clients
    #[arg(long = "tls-capath", value_name = "DIR")]
    pub capath: Option<PathBuf>,

    /// Root directory on the filesystem to serve
    #[arg(long = "dir", value_name = "DIR")]
    pub root_directory: Option<PathBuf>,

    /// CGI script directory, relative to the root directory
    #[arg(long = "cgi-dir", value_name = "DIR")]
    pub cgi_directory: Option<String>,

    /// File served in place of a generated directory listing
    #[arg(long, value_name = "FILE")]
    pub index_file: Option<String>,

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
    pub tls: TlsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of async worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
    /// Seconds to wait for the request line
    #[serde(default)]
    pub request_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            max_connections: default_max_connections(),
            workers: None,
            blocking_threads: default_blocking_threads(),
            request_timeout: 0,
        }
    }
}

/// TLS file locations
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
}

/// Static directory configuration
#[derive(Debug, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_root_directory")]
    pub root: PathBuf,
    #[serde(default = "default_cgi_directory")]
    pub cgi_directory: String,
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_root_directory(),
            cgi_directory: default_cgi_directory(),
            index_file: default_index_file(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1965
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_blocking_threads() -> usize {
    512 // tokio's default blocking pool size
}

fn default_root_directory() -> PathBuf {
    PathBuf::from("/var/gemini")
}

fn default_cgi_directory() -> String {
    "cgi-bin".to_string()
}

fn default_index_file() -> String {
    "index.gmi".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub hostname: String,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub blocking_threads: usize,
    pub request_timeout: Option<Duration>,
    pub tls: TlsSettings,
    pub root_directory: PathBuf,
    pub cgi_directory: String,
    pub index_file: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let request_timeout = cli
            .request_timeout
            .unwrap_or(toml_config.server.request_timeout);

        let blocking_threads = cli
            .blocking_threads
            .unwrap_or(toml_config.server.blocking_threads);
        if blocking_threads == 0 {
            return Err(ConfigError::Invalid("blocking_threads must be at least 1"));
        }

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            hostname: cli.hostname.unwrap_or(toml_config.server.hostname),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            blocking_threads,
            request_timeout: (request_timeout > 0).then(|| Duration::from_secs(request_timeout)),
            tls: TlsSettings {
                certfile: cli.certfile.or(toml_config.tls.certfile),
                keyfile: cli.keyfile.or(toml_config.tls.keyfile),
                cafile: cli.cafile.or(toml_config.tls.cafile),
                capath: cli.capath.or(toml_config.tls.capath),
            },
            root_directory: cli.root_directory.unwrap_or(toml_config.files.root),
            cgi_directory: cli
                .cgi_directory
                .unwrap_or(toml_config.files.cgi_directory),
            index_file: cli.index_file.unwrap_or(toml_config.files.index_file),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Address to bind the listener to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
