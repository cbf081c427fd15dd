//! Courier Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Values here are the startup snapshot; pool specs, routing and the scalar
//! toggles can later be replaced at runtime through live configuration pushes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pool: ProviderPoolConfig,
    pub timeout: TimeoutConfig,
    pub client: ClientConfig,
}

/// How the default request pool is chosen. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
    /// One process-wide pool shared by every listening endpoint
    #[default]
    Shared,
    /// One pool per listening endpoint
    Server,
    /// Shared default pool, and every registered service gets standalone pools
    Method,
}

impl std::str::FromStr for PoolStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(PoolStrategy::Shared),
            "server" => Ok(PoolStrategy::Server),
            "method" => Ok(PoolStrategy::Method),
            other => Err(ConfigError::ValidationError(format!("unknown pool strategy: {}", other))),
        }
    }
}

/// Provider listener and default pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub pool_strategy: PoolStrategy,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub work_queue_size: usize,
    /// Global inbound request rate limit per second (0 = unlimited)
    pub rate_limit_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4040,
            pool_strategy: PoolStrategy::Shared,
            core_pool_size: 60,
            max_pool_size: 500,
            work_queue_size: 1000,
            rate_limit_per_second: 0,
        }
    }
}

/// Slow pool, admission and live pool defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPoolConfig {
    pub enable_slow_pool: bool,
    pub slow_core_size: usize,
    pub slow_max_size: usize,
    pub slow_queue_size: usize,
    /// Fraction of max pool size at which new requests should be shed
    pub cancel_ratio: f32,
    /// Default concurrency for method pools registered without an explicit size
    pub default_actives: usize,
    /// `core = actives / core_ratio` for pools sized from actives
    pub core_ratio: f32,
    /// Initial named pool specs (JSON array)
    pub pool_config: String,
    /// Initial route to pool name mapping (JSON object)
    pub api_pool_config: String,
}

impl Default for ProviderPoolConfig {
    fn default() -> Self {
        Self {
            enable_slow_pool: true,
            slow_core_size: 30,
            slow_max_size: 200,
            slow_queue_size: 500,
            cancel_ratio: 1.0,
            default_actives: 60,
            core_ratio: 3.0,
            pool_config: String::new(),
            api_pool_config: String::new(),
        }
    }
}

/// Timeout scanning and slow classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub check_interval_ms: u64,
    /// Budget applied when a request carries no timeout of its own
    pub default_timeout_ms: u64,
    /// Timeouts within the window before a route is classified slow
    pub slow_threshold: u32,
    pub slow_window_ms: u64,
    /// How long a route stays classified slow after its last qualifying timeout
    pub quarantine_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            default_timeout_ms: 5000,
            slow_threshold: 3,
            slow_window_ms: 60_000,
            quarantine_ms: 300_000,
        }
    }
}

impl TimeoutConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// Invoker-side connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    /// Outbound messages buffered per connection before writes fail fast
    pub write_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            write_queue_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject settings no pool could be built from
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.max_pool_size == 0 || server.core_pool_size > server.max_pool_size {
            return Err(ConfigError::ValidationError(format!(
                "server pool core {} / max {} is invalid",
                server.core_pool_size, server.max_pool_size
            )));
        }
        let pool = &self.pool;
        if pool.slow_max_size == 0 || pool.slow_core_size > pool.slow_max_size {
            return Err(ConfigError::ValidationError(format!(
                "slow pool core {} / max {} is invalid",
                pool.slow_core_size, pool.slow_max_size
            )));
        }
        if !(pool.cancel_ratio > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "cancel ratio must be positive, got {}",
                pool.cancel_ratio
            )));
        }
        if !(pool.core_ratio > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "core ratio must be positive, got {}",
                pool.core_ratio
            )));
        }
        for (name, raw) in [("pool_config", &pool.pool_config), ("api_pool_config", &pool.api_pool_config)] {
            if !raw.trim().is_empty() {
                serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                    ConfigError::ValidationError(format!("{} is not valid JSON: {}", name, e))
                })?;
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Courier Configuration
# Environment variables (COURIER_*) override these settings

[server]
host = "0.0.0.0"
port = 4040
pool_strategy = "shared"  # shared, server, or method
core_pool_size = 60
max_pool_size = 500
work_queue_size = 1000
rate_limit_per_second = 0  # 0 disables the limit

[pool]
enable_slow_pool = true
slow_core_size = 30
slow_max_size = 200
slow_queue_size = 500
cancel_ratio = 1.0
default_actives = 60
core_ratio = 3.0
pool_config = ""
api_pool_config = ""

[timeout]
check_interval_ms = 1000
default_timeout_ms = 5000
slow_threshold = 3
slow_window_ms = 60000
quarantine_ms = 300000

[client]
connect_timeout_ms = 3000
write_queue_capacity = 1024
"#
        .to_string()
    }
}
