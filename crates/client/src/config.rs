//! Configuration management for the NodeLink client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nodelink/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port of the node a fresh install talks to.
pub const DEFAULT_NODE_PORT: u16 = 5050;

/// Default port of the HTTP health endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one node candidate must be configured")]
    NoCandidates,

    #[error("candidate host must not be empty (port {0})")]
    EmptyCandidateHost(u16),

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("zstd compression_level must be between 1 and 22, got {0}")]
    InvalidCompressionLevel(i32),

    #[error("compression must be one of: zstd, lz4; got {0}")]
    InvalidCompression(String),

    #[error("pool workers must be greater than 0")]
    ZeroWorkers,

    #[error("max_pending must be greater than 0")]
    ZeroMaxPending,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("invalid node address {0:?}, expected host:port")]
    InvalidNodeAddress(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the NodeLink client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General client configuration.
    pub client: ClientConfig,

    /// Candidate nodes and probing.
    pub nodes: NodesConfig,

    /// Session behavior.
    pub session: SessionConfig,

    /// Message compression.
    pub codec: CodecConfig,

    /// Transform offload pool.
    pub pool: PoolConfig,

    /// HTTP health endpoint.
    pub http: HttpConfig,
}

/// General client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for the error log file. Unset disables file logging.
    pub log_dir: Option<PathBuf>,
}

/// One configured node endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddress {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddress {
    /// Creates a node address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`. IPv6 hosts must be bracketed.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidNodeAddress(value.to_string());
        let (host, port) = value.trim().rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = match host.strip_prefix('[') {
            Some(inner) => {
                let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
                inner.parse::<IpAddr>().map_err(|_| invalid())?;
                inner
            }
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

/// Candidate nodes and probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodesConfig {
    /// Nodes to choose from, in preference order for equal latency.
    pub candidates: Vec<NodeAddress>,

    /// Timeout for a single reachability probe in milliseconds.
    pub probe_timeout_ms: u64,

    /// Timeout for opening the session connection in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed for the node to send its public key, in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Default wait for a response, in seconds.
    pub receive_timeout_secs: u64,

    /// Upper bound on responses held for callers.
    pub max_pending: usize,
}

/// Compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodecConfig {
    /// Compression algorithm: `zstd` or `lz4`.
    pub compression: String,

    /// zstd level (1-22). Ignored for lz4.
    pub compression_level: i32,
}

/// Offload pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of transforms running at once.
    pub workers: usize,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind.
    pub bind: String,

    /// Port to listen on.
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            candidates: vec![NodeAddress::new("0.0.0.0", DEFAULT_NODE_PORT)],
            probe_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            receive_timeout_secs: 20,
            max_pending: 4096,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            compression_level: protocol::DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl NodesConfig {
    /// Probe timeout as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SessionConfig {
    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Default receive timeout as a duration.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl CodecConfig {
    /// Resolves the configured algorithm.
    pub fn compression(&self) -> Result<Compression, ConfigError> {
        match self.compression.to_lowercase().as_str() {
            "zstd" => Ok(Compression::Zstd {
                level: self.compression_level,
            }),
            "lz4" => Ok(Compression::Lz4),
            _ => Err(ConfigError::InvalidCompression(self.compression.clone())),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nodelink")
        .join("config.toml")
}

/// An environment variable seen by [`Config::apply_env_overrides`].
///
/// Overrides are applied before logging is set up, so they are returned to
/// the caller and logged afterwards with [`EnvOverride::log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    /// Variable name.
    pub var: &'static str,
    /// Raw value as read from the environment.
    pub value: String,
    /// False when the value was invalid and ignored.
    pub applied: bool,
}

impl EnvOverride {
    fn applied(var: &'static str, value: String) -> Self {
        Self {
            var,
            value,
            applied: true,
        }
    }

    /// Emits the override at `info`, or at `warn` if it was ignored.
    pub fn log(&self) {
        if self.applied {
            tracing::info!("Overriding {} from environment: {}", self.var, self.value);
        } else {
            tracing::warn!("Ignoring invalid {} value: {}", self.var, self.value);
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NODELINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - NODELINK_NODES: Replace the candidate list (comma-separated host:port)
    /// - PORT: Override the HTTP port
    ///
    /// Returns every non-empty variable that was consulted.
    pub fn apply_env_overrides(&mut self) -> Result<Vec<EnvOverride>, ConfigError> {
        let mut seen = Vec::new();

        if let Ok(level) = std::env::var("NODELINK_LOG_LEVEL") {
            if !level.is_empty() {
                self.client.log_level = level.clone();
                seen.push(EnvOverride::applied("NODELINK_LOG_LEVEL", level));
            }
        }

        if let Ok(nodes) = std::env::var("NODELINK_NODES") {
            if !nodes.trim().is_empty() {
                let candidates = nodes
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(NodeAddress::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                self.nodes.candidates = candidates;
                seen.push(EnvOverride::applied("NODELINK_NODES", nodes));
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                let parsed = port.parse::<u16>();
                if let Ok(value) = parsed {
                    self.http.port = value;
                }
                seen.push(EnvOverride {
                    var: "PORT",
                    value: port,
                    applied: parsed.is_ok(),
                });
            }
        }

        Ok(seen)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        if let Some(node) = self.nodes.candidates.iter().find(|n| n.host.is_empty()) {
            return Err(ConfigError::EmptyCandidateHost(node.port));
        }

        if self.nodes.probe_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("probe_timeout_ms"));
        }
        if self.nodes.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_ms"));
        }
        if self.session.handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("handshake_timeout_ms"));
        }
        if self.session.receive_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("receive_timeout_secs"));
        }

        if let Compression::Zstd { level } = self.codec.compression()? {
            if !(1..=22).contains(&level) {
                return Err(ConfigError::InvalidCompressionLevel(level));
            }
        }

        if self.pool.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.session.max_pending == 0 {
            return Err(ConfigError::ZeroMaxPending);
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
