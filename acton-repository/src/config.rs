//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `ACTON_REPOSITORY_`, nested keys split on `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/acton-repository/{name}/config.toml
//! 4. System directory: /etc/acton-repository/{name}/config.toml
//! 5. Default values
//!
//! ```toml
//! log_level = "debug"
//!
//! [database]
//! url = "postgres://app@localhost/app"
//! max_connections = 20
//!
//! [stats]
//! title = "db stats"
//! top = 20
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

const ENV_PREFIX: &str = "ACTON_REPOSITORY_";
const XDG_PREFIX: &str = "acton-repository";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name used to locate config files and in log lines
    #[serde(default = "default_name")]
    pub name: String,

    /// `EnvFilter` directive for the tracing subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database connection (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Query stats aggregation
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL (`postgres://...` or `sqlite:...`)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl DatabaseConfig {
    /// Configuration for a URL with default pool settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Query stats configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Whether samples are collected at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Report title (upper-cased in the report)
    #[serde(default = "default_stats_title")]
    pub title: String,

    /// Number of descriptors per report
    #[serde(default = "default_stats_top")]
    pub top: usize,

    /// Steady reporting interval in seconds
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,

    /// Shorter delays before the first reports, in seconds
    #[serde(default = "default_stats_warmup")]
    pub warmup_secs: Vec<u64>,

    /// Distinct descriptors above which a warning is logged
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,

    /// Distinct descriptors above which aggregates are reported and reset
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold: usize,

    /// Samples buffered between callers and the aggregator
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            title: default_stats_title(),
            top: default_stats_top(),
            interval_secs: default_stats_interval(),
            warmup_secs: default_stats_warmup(),
            warn_threshold: default_warn_threshold(),
            reset_threshold: default_reset_threshold(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "acton-repository".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_stats_title() -> String {
    "db stats".to_string()
}

fn default_stats_top() -> usize {
    10
}

fn default_stats_interval() -> u64 {
    3600
}

fn default_stats_warmup() -> Vec<u64> {
    vec![600, 1800]
}

fn default_warn_threshold() -> usize {
    500
}

fn default_reset_threshold() -> usize {
    1000
}

fn default_channel_capacity() -> usize {
    4096
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The name is inferred from the binary name.
    pub fn load() -> Result<Self> {
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(default_name);

        Self::load_for_service(&name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::named(name)));

        // Lowest priority first so higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, then environment variables
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Parse configuration from TOML text over the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()?;

        Ok(config)
    }

    /// Candidate config file paths, highest priority first
    fn find_config_paths(name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(XDG_PREFIX);
        let config_file_path = Path::new(name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc")
                .join(XDG_PREFIX)
                .join(name)
                .join("config.toml"),
        );

        paths
    }

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            database: None,
            stats: StatsConfig::default(),
        }
    }
}
