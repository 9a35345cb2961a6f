//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Environment variables that may carry the remote store URL, in priority order.
pub const REMOTE_URL_ENV_KEYS: [&str; 4] = ["REDIS_URL", "REDIS_URI", "KV_URL", "UPSTASH_REDIS_URL"];

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// When set, the peer socket address belongs to a proxy and is not used
    /// as the client's originating IP.
    #[serde(default)]
    pub behind_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            behind_proxy: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Remote counter store URL; selects the Redis backend when present
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Prefix for remote counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often expired in-memory windows are reclaimed, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on one remote check, in milliseconds
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            remote_timeout_ms: default_remote_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_remote_timeout() -> u64 {
    500
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Fill in settings the process environment provides.
    ///
    /// A remote URL set in the file wins over the environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_env_source(::config::Environment::default())
    }

    /// Like [`TurnstileConfig::with_env`], reading from an explicit source.
    pub fn with_env_source(mut self, source: ::config::Environment) -> Result<Self> {
        if self.rate_limiting.remote_url.is_none() {
            self.rate_limiting.remote_url = remote_url_from(source)?;
        }
        Ok(self)
    }
}

/// First non-empty remote store URL among the known aliases.
fn remote_url_from(source: ::config::Environment) -> Result<Option<String>> {
    let env = ::config::Config::builder().add_source(source).build()?;

    Ok(REMOTE_URL_ENV_KEYS.iter().find_map(|key| {
        env.get_string(&key.to_lowercase())
            .or_else(|_| env.get_string(key))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }))
}
