//! Configuration module for the netprobe server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the diagnostics server
#[derive(Parser, Debug, Default)]
#[command(name = "netprobe")]
#[command(author = "netprobe authors")]
#[command(version = "0.1.0")]
#[command(about = "A network diagnostics server speaking a line protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Timeout for a single ICMP echo probe in milliseconds
    #[arg(long)]
    pub ping_timeout_ms: Option<u64>,

    /// Timeout for a single TCP connect attempt in milliseconds
    #[arg(long)]
    pub port_timeout_ms: Option<u64>,

    /// Close sessions idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

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
    pub probe: ProbeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle read deadline for sessions in seconds (0 = disabled)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Probe-related configuration
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub port_timeout_ms: u64,
    /// Pause between repeated attempts against the same port
    #[serde(default = "default_attempt_pause")]
    pub attempt_pause_ms: u64,
    /// Widest port range a single `/port` command may scan
    #[serde(default = "default_max_scan_ports")]
    pub max_scan_ports: u32,
    /// Upper bound for `numRequests`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_probe_timeout(),
            port_timeout_ms: default_probe_timeout(),
            attempt_pause_ms: default_attempt_pause(),
            max_scan_ports: default_max_scan_ports(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Registry configuration
#[derive(Debug, Deserialize, Default)]
pub struct RegistryConfig {
    /// Records inserted when the server starts
    #[serde(default)]
    pub seed: Vec<SeedUser>,
}

/// A user record declared in the configuration file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SeedUser {
    pub name: String,
    pub age: i64,
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
    "127.0.0.1:9999".to_string()
}

fn default_max_sessions() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_probe_timeout() -> u64 {
    1000 // 1 second
}

fn default_attempt_pause() -> u64 {
    200
}

fn default_max_scan_ports() -> u32 {
    1024
}

fn default_max_attempts() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub ping_timeout_ms: u64,
    pub port_timeout_ms: u64,
    pub attempt_pause_ms: u64,
    pub max_scan_ports: u32,
    pub max_attempts: u32,
    pub seed_users: Vec<SeedUser>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
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

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_sessions: cli
                .max_sessions
                .unwrap_or(toml_config.server.max_sessions),
            idle_timeout_secs: cli
                .idle_timeout_secs
                .unwrap_or(toml_config.server.idle_timeout_secs),
            ping_timeout_ms: cli
                .ping_timeout_ms
                .unwrap_or(toml_config.probe.ping_timeout_ms),
            port_timeout_ms: cli
                .port_timeout_ms
                .unwrap_or(toml_config.probe.port_timeout_ms),
            attempt_pause_ms: toml_config.probe.attempt_pause_ms,
            max_scan_ports: toml_config.probe.max_scan_ports,
            max_attempts: toml_config.probe.max_attempts,
            seed_users: toml_config.registry.seed,
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn attempt_pause(&self) -> Duration {
        Duration::from_millis(self.attempt_pause_ms)
    }

    /// Idle read deadline, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
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
