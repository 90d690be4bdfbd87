//! Configuration Module
//!
//! Provides TOML-based configuration for vibemesh with support for:
//! - Server settings (bind address, limits)
//! - The licence the broker runs under
//! - Topic matching strategy
//! - Message storage and retention
//! - Presence and survey tuning
//! - Clustering
//! - Environment variable overrides (VIBEMESH__* prefix)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::security::License;
use crate::topic::MatchStrategy;

// Re-export cluster config types
pub use cluster::ClusterConfig;

mod cluster;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub license: LicenseConfig,
    pub matching: MatchingConfig,
    pub storage: StorageConfig,
    pub presence: PresenceConfig,
    pub survey: SurveyConfig,
    pub cluster: ClusterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Maximum number of connections (0 = unbounded)
    pub max_connections: usize,
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Pending outbound bytes per connection before messages are dropped
    pub outbound_buffer_size: usize,
    /// Keep alive in seconds when the client asks for none
    pub default_keep_alive: u16,
    /// Time allowed for the CONNECT packet to arrive
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            outbound_buffer_size: 4 * 1024 * 1024,
            default_keep_alive: 60,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Licence configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Licence string; a temporary one is generated when empty
    pub license: String,
}

impl LicenseConfig {
    pub fn parse(&self) -> Result<Option<License>, ConfigError> {
        if self.license.is_empty() {
            return Ok(None);
        }
        self.license
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Validation(format!("invalid license: {}", e)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Memory,
    Fjall,
    Noop,
}

/// Message history configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Directory of the fjall keyspace
    pub path: PathBuf,
    /// Upper bound on a message TTL; retained messages keep this long
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Memory,
            path: PathBuf::from("./data"),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// Presence notification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Pending notifications before new ones are dropped
    pub queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            queue_size: 100_000,
            flush_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    /// How long to wait for peers to answer
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Inbox of the survey dispatcher, in messages
    pub queue_size: usize,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            queue_size: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEMESH__` prefix with double underscores for nesting:
    ///    - `VIBEMESH__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `VIBEMESH__LICENSE__LICENSE=...` overrides `license.license`
    ///    - `VIBEMESH__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("matching.strategy", "emitter")?
            .set_default("storage.provider", "memory")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMESH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.log.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.log.level
            )));
        }

        if self.server.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "server.max_packet_size must be positive".to_string(),
            ));
        }
        if self.server.outbound_buffer_size < self.server.max_packet_size {
            return Err(ConfigError::Validation(
                "server.outbound_buffer_size must hold at least one packet".to_string(),
            ));
        }

        self.license.parse()?;

        if self.storage.provider == StorageProvider::Fjall && self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "storage.path is required for the fjall provider".to_string(),
            ));
        }
        if self.storage.retention.is_zero() {
            return Err(ConfigError::Validation(
                "storage.retention must be positive".to_string(),
            ));
        }
        if self.storage.gc_interval.is_zero() {
            return Err(ConfigError::Validation(
                "storage.gc_interval must be positive".to_string(),
            ));
        }

        if self.presence.queue_size == 0 {
            return Err(ConfigError::Validation(
                "presence.queue_size must be positive".to_string(),
            ));
        }
        if self.presence.flush_interval.is_zero() {
            return Err(ConfigError::Validation(
                "presence.flush_interval must be positive".to_string(),
            ));
        }
        if self.survey.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "survey.timeout must be positive".to_string(),
            ));
        }

        if self.cluster.enabled {
            if self.cluster.gossip_addr == self.cluster.peer_addr {
                return Err(ConfigError::Validation(
                    "cluster.gossip_addr and cluster.peer_addr must differ".to_string(),
                ));
            }
            if self.cluster.gossip_interval.is_zero() {
                return Err(ConfigError::Validation(
                    "cluster.gossip_interval must be positive".to_string(),
                ));
            }
            if self.cluster.max_frame_entries == 0 {
                return Err(ConfigError::Validation(
                    "cluster.max_frame_entries must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}
