//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "courier.toml",
    "config.toml",
    "./config/courier.toml",
    "/etc/courier/courier.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    search_standard_paths: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            search_standard_paths: true,
        }
    }

    /// Create a loader with a specific config file path.
    /// Standard paths are not searched when the file is missing.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            search_standard_paths: false,
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("COURIER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if !self.search_standard_paths {
            return None;
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Server
        if let Ok(val) = env::var("COURIER_SERVER_HOST") {
            config.server.host = val;
        }
        override_parsed("COURIER_SERVER_PORT", &mut config.server.port);
        override_parsed("COURIER_POOL_STRATEGY", &mut config.server.pool_strategy);
        override_parsed("COURIER_CORE_POOL_SIZE", &mut config.server.core_pool_size);
        override_parsed("COURIER_MAX_POOL_SIZE", &mut config.server.max_pool_size);
        override_parsed("COURIER_WORK_QUEUE_SIZE", &mut config.server.work_queue_size);
        override_parsed("COURIER_RATE_LIMIT_PER_SECOND", &mut config.server.rate_limit_per_second);

        // Provider pools
        override_parsed("COURIER_SLOW_POOL_ENABLE", &mut config.pool.enable_slow_pool);
        override_parsed("COURIER_SLOW_POOL_CORE_SIZE", &mut config.pool.slow_core_size);
        override_parsed("COURIER_SLOW_POOL_MAX_SIZE", &mut config.pool.slow_max_size);
        override_parsed("COURIER_SLOW_POOL_QUEUE_SIZE", &mut config.pool.slow_queue_size);
        override_parsed("COURIER_CANCEL_RATIO", &mut config.pool.cancel_ratio);
        override_parsed("COURIER_DEFAULT_ACTIVES", &mut config.pool.default_actives);
        override_parsed("COURIER_CORE_RATIO", &mut config.pool.core_ratio);
        if let Ok(val) = env::var("COURIER_POOL_CONFIG") {
            config.pool.pool_config = val;
        }
        if let Ok(val) = env::var("COURIER_API_POOL_CONFIG") {
            config.pool.api_pool_config = val;
        }

        // Timeouts
        override_parsed("COURIER_TIMEOUT_CHECK_INTERVAL_MS", &mut config.timeout.check_interval_ms);
        override_parsed("COURIER_DEFAULT_TIMEOUT_MS", &mut config.timeout.default_timeout_ms);
        override_parsed("COURIER_SLOW_THRESHOLD", &mut config.timeout.slow_threshold);
        override_parsed("COURIER_SLOW_WINDOW_MS", &mut config.timeout.slow_window_ms);
        override_parsed("COURIER_QUARANTINE_MS", &mut config.timeout.quarantine_ms);

        // Client
        override_parsed("COURIER_CONNECT_TIMEOUT_MS", &mut config.client.connect_timeout_ms);
        override_parsed("COURIER_WRITE_QUEUE_CAPACITY", &mut config.client.write_queue_capacity);
    }
}

/// Overwrite `target` with the parsed env value; unparsable values are logged and skipped.
fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = key, value = %val, "Ignoring unparsable environment override"),
        }
    }
}
