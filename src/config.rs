//! Configuration management for Turnstile.
//!
//! Configuration comes from an optional YAML file, then environment
//! overrides. Only the binary loads it; the limiter itself is handed an
//! already-parsed [`RateLimitConfig`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{RateLimitConfig, TokenLimit};
use crate::store::RedisStoreConfig;

const TOKEN_LIMIT_PREFIX: &str = "TOKEN_LIMIT_";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter and block storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Budget for a single rate limit check, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_timeout_ms() -> u64 {
    1000
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process maps; state is per process and lost on restart.
    Memory,
    /// Shared Redis; falls back to memory if unreachable at startup.
    #[default]
    Redis,
}

impl FromStr for StorageBackend {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "redis" => Ok(StorageBackend::Redis),
            other => Err(TurnstileError::Config(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Namespace prefix for block keys
    #[serde(default = "default_block_prefix")]
    pub block_prefix: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            block_prefix: default_block_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            db: self.db,
            block_prefix: self.block_prefix.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_block_prefix() -> String {
    "block:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Parse an override, logging and skipping malformed values.
fn parse_override<T: FromStr>(name: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = %name, value = %value, "Ignoring malformed environment override");
            None
        }
    }
}

/// Parse `<requests_per_second>:<block_duration_minutes>`.
fn parse_token_limit(value: &str) -> Option<TokenLimit> {
    let (rps, minutes) = value.split_once(':')?;
    Some(TokenLimit {
        requests_per_second: rps.trim().parse().ok()?,
        block_duration_minutes: minutes.trim().parse().ok()?,
    })
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_vars(std::env::vars());
    }

    /// Apply overrides from `(name, value)` pairs.
    ///
    /// Recognized: `SERVER_PORT`, `STORAGE_BACKEND`, `REDIS_HOST`,
    /// `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`,
    /// `RATE_LIMIT_IP_REQUESTS_PER_SECOND`,
    /// `RATE_LIMIT_IP_BLOCK_DURATION_MINUTES`, and
    /// `TOKEN_LIMIT_<token>=<requests_per_second>:<block_duration_minutes>`.
    /// Empty values are treated as unset.
    pub fn apply_env_vars<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if value.is_empty() {
                continue;
            }

            match name.as_str() {
                "SERVER_PORT" => {
                    if let Some(port) = parse_override(&name, &value) {
                        self.server.listen_addr.set_port(port);
                    }
                }
                "STORAGE_BACKEND" => {
                    if let Some(backend) = parse_override(&name, &value) {
                        self.storage.backend = backend;
                    }
                }
                "REDIS_HOST" => self.storage.redis.host = value,
                "REDIS_PORT" => {
                    if let Some(port) = parse_override(&name, &value) {
                        self.storage.redis.port = port;
                    }
                }
                "REDIS_PASSWORD" => self.storage.redis.password = Some(value),
                "REDIS_DB" => {
                    if let Some(db) = parse_override(&name, &value) {
                        self.storage.redis.db = db;
                    }
                }
                "RATE_LIMIT_IP_REQUESTS_PER_SECOND" => {
                    if let Some(rps) = parse_override(&name, &value) {
                        self.rate_limit.ip_requests_per_second = rps;
                    }
                }
                "RATE_LIMIT_IP_BLOCK_DURATION_MINUTES" => {
                    if let Some(minutes) = parse_override(&name, &value) {
                        self.rate_limit.ip_block_duration_minutes = minutes;
                    }
                }
                _ => {
                    let Some(token) = name.strip_prefix(TOKEN_LIMIT_PREFIX) else {
                        continue;
                    };
                    if token.is_empty() {
                        continue;
                    }
                    match parse_token_limit(&value) {
                        Some(limit) => {
                            self.rate_limit.token_limits.insert(token.to_string(), limit);
                        }
                        None => warn!(
                            var = %name,
                            "Ignoring token limit, expected <requests_per_second>:<block_duration_minutes>"
                        ),
                    }
                }
            }
        }
    }

    /// Check the whole configuration before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.server.request_timeout_ms == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.rate_limit.validate()
    }
}
