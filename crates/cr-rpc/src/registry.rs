//! PoolRegistry - named pools and routes driven by live configuration
//!
//! Both maps are published whole behind an `Arc` and swapped on update, so
//! readers never observe a half-applied push. Pools named by a push are only
//! built when a request first resolves to them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use cr_common::{InvocationRequest, PoolSpec};
use cr_config::{ProviderPoolConfig, ServerConfig};
use crate::error::RpcError;
use crate::pool::ThreadPool;
use crate::rpc_metrics;
use crate::Result;

const KEY_POOL_CONFIG: &str = "provider.pool.config";
const KEY_API_POOL_CONFIG: &str = "provider.pool.api.config";
const KEY_SLOW_POOL_ENABLE: &str = "provider.pool.slow.enable";
const KEY_CANCEL_RATIO: &str = "timeout.cancelratio";
const KEY_CORE_RATIO: &str = "provider.pool.ratio.coresize";
const KEY_SHARED_CORE_SIZE: &str = "provider.pool.shared.coresize";
const KEY_SHARED_MAX_SIZE: &str = "provider.pool.shared.maxsize";
const KEY_SHARED_QUEUE_SIZE: &str = "provider.pool.shared.queuesize";

pub const SHARED_POOL_NAME: &str = "shared";
pub const SLOW_POOL_NAME: &str = "slow";

/// A pushed pool spec and, once referenced, its running pool
struct LivePool {
    spec: PoolSpec,
    pool: OnceLock<Arc<ThreadPool>>,
}

impl LivePool {
    fn new(spec: PoolSpec) -> Self {
        Self {
            spec,
            pool: OnceLock::new(),
        }
    }

    fn get_or_create(&self) -> Arc<ThreadPool> {
        self.pool
            .get_or_init(|| {
                info!(
                    pool = %self.spec.pool_name,
                    core_size = self.spec.core_size,
                    max_size = self.spec.max_size,
                    queue_capacity = self.spec.queue_capacity,
                    "Creating live-config pool"
                );
                Arc::new(ThreadPool::new(
                    self.spec.pool_name.clone(),
                    self.spec.core_size,
                    self.spec.max_size,
                    self.spec.queue_capacity,
                ))
            })
            .clone()
    }
}

/// Process-scoped pools plus everything live configuration can change
pub struct PoolRegistry {
    pools: RwLock<Arc<HashMap<String, Arc<LivePool>>>>,
    routes: RwLock<Arc<HashMap<String, String>>>,
    shared_pool: RwLock<Arc<ThreadPool>>,
    slow_pool: Arc<ThreadPool>,
    enable_slow_pool: AtomicBool,
    /// f32 bits
    cancel_ratio: AtomicU32,
    /// f32 bits
    core_ratio: AtomicU32,
    default_actives: usize,
}

impl PoolRegistry {
    pub fn new(server: &ServerConfig, config: &ProviderPoolConfig) -> Self {
        let registry = Self {
            pools: RwLock::new(Arc::new(HashMap::new())),
            routes: RwLock::new(Arc::new(HashMap::new())),
            shared_pool: RwLock::new(Arc::new(ThreadPool::new(
                SHARED_POOL_NAME,
                server.core_pool_size,
                server.max_pool_size,
                server.work_queue_size,
            ))),
            slow_pool: Arc::new(ThreadPool::new(
                SLOW_POOL_NAME,
                config.slow_core_size,
                config.slow_max_size,
                config.slow_queue_size,
            )),
            enable_slow_pool: AtomicBool::new(config.enable_slow_pool),
            cancel_ratio: AtomicU32::new(config.cancel_ratio.to_bits()),
            core_ratio: AtomicU32::new(config.core_ratio.to_bits()),
            default_actives: config.default_actives,
        };

        if let Err(e) = registry.apply_pool_config(&config.pool_config) {
            error!(error = %e, "Ignoring invalid initial pool config");
        }
        if let Err(e) = registry.apply_route_config(&config.api_pool_config) {
            error!(error = %e, "Ignoring invalid initial api pool config");
        }

        registry
    }

    /// React to a pushed configuration value. Unknown keys are ignored and
    /// malformed values leave the current configuration in place.
    pub fn on_key_updated(&self, key: &str, value: &str) {
        let result = if key.ends_with(KEY_POOL_CONFIG) {
            self.apply_pool_config(value)
        } else if key.ends_with(KEY_API_POOL_CONFIG) {
            self.apply_route_config(value)
        } else if key.ends_with(KEY_SLOW_POOL_ENABLE) {
            parse_value::<bool>(key, value).map(|enabled| self.set_slow_pool_enabled(enabled))
        } else if key.ends_with(KEY_CANCEL_RATIO) {
            parse_positive_ratio(key, value).map(|ratio| self.set_cancel_ratio(ratio))
        } else if key.ends_with(KEY_CORE_RATIO) {
            parse_positive_ratio(key, value).map(|ratio| self.set_core_ratio(ratio))
        } else if key.ends_with(KEY_SHARED_CORE_SIZE) {
            parse_value::<usize>(key, value).and_then(|size| self.resize_shared_pool(Some(size), None, None))
        } else if key.ends_with(KEY_SHARED_MAX_SIZE) {
            parse_value::<usize>(key, value).and_then(|size| self.resize_shared_pool(None, Some(size), None))
        } else if key.ends_with(KEY_SHARED_QUEUE_SIZE) {
            parse_value::<usize>(key, value).and_then(|size| self.resize_shared_pool(None, None, Some(size)))
        } else {
            return;
        };

        match result {
            Ok(()) => info!(key = key, "Applied live configuration update"),
            Err(e) => error!(key = key, value = value, error = %e, "Rejected live configuration update"),
        }
    }

    /// Replace the named-pool map from a JSON array of pool specs.
    ///
    /// The whole batch is rejected on duplicate names or any invalid spec.
    /// Specs equal to a running one keep that pool; changed and removed
    /// pools are drained in the background.
    pub fn apply_pool_config(&self, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Ok(());
        }

        let specs: Vec<PoolSpec> = serde_json::from_str(raw)?;
        let mut seen = HashSet::with_capacity(specs.len());
        for spec in &specs {
            spec.validate()?;
            if !seen.insert(spec.pool_name.as_str()) {
                return Err(RpcError::Config(format!(
                    "duplicate pool name [{}] in pool config",
                    spec.pool_name
                )));
            }
        }

        let retired = {
            let mut guard = self.pools.write();
            let current = guard.clone();

            let next: HashMap<String, Arc<LivePool>> = specs
                .into_iter()
                .map(|spec| {
                    let live = match current.get(&spec.pool_name) {
                        Some(existing) if existing.spec == spec => existing.clone(),
                        _ => Arc::new(LivePool::new(spec)),
                    };
                    (live.spec.pool_name.clone(), live)
                })
                .collect();

            let retired: Vec<Arc<ThreadPool>> = current
                .iter()
                .filter(|&(name, old)| next.get(name).map_or(true, |new| !Arc::ptr_eq(new, old)))
                .filter_map(|(_, old)| old.pool.get().cloned())
                .collect();

            info!(
                pools = next.len(),
                retired = retired.len(),
                "Publishing live pool configuration"
            );
            *guard = Arc::new(next);
            retired
        };

        for pool in retired {
            retire_pool(pool);
        }
        Ok(())
    }

    /// Replace the routing table from a JSON object `route -> pool name`.
    /// A blank value keeps the current table.
    pub fn apply_route_config(&self, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Ok(());
        }

        let routes: HashMap<String, String> = serde_json::from_str(raw)?;
        debug!(routes = routes.len(), "Publishing pool routing table");
        *self.routes.write() = Arc::new(routes);
        Ok(())
    }

    /// Pool for a name in the current snapshot, built on first use
    /// Instantiates under the read lock, so a concurrent push always sees
    /// the instance it replaces.
    pub fn pool(&self, name: &str) -> Option<Arc<ThreadPool>> {
        let pools = self.pools.read();
        pools.get(name).map(|live| live.get_or_create())
    }

    pub fn pool_spec(&self, name: &str) -> Option<PoolSpec> {
        self.pools.read().get(name).map(|live| live.spec.clone())
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Pools that have been built, ordered by name
    pub fn instantiated_pools(&self) -> Vec<Arc<ThreadPool>> {
        let pools = self.pools.read().clone();
        let mut built: Vec<Arc<ThreadPool>> = pools
            .values()
            .filter_map(|live| live.pool.get().cloned())
            .collect();
        built.sort_by(|a, b| a.name().cmp(b.name()));
        built
    }

    pub fn route(&self, route: &str) -> Option<String> {
        self.routes.read().get(route).cloned()
    }

    /// Live-config pool for a request: a method route wins, and the service
    /// route is only consulted when no method route exists.
    pub fn resolve(&self, request: &InvocationRequest) -> Option<Arc<ThreadPool>> {
        let routes = self.routes.read().clone();
        if routes.is_empty() {
            return None;
        }

        let pool_name = match routes.get(&request.route_key()) {
            Some(name) if !name.trim().is_empty() => name,
            _ => routes
                .get(&request.service_name)
                .filter(|name| !name.trim().is_empty())?,
        };
        self.pool(pool_name)
    }

    pub fn shared_pool(&self) -> Arc<ThreadPool> {
        self.shared_pool.read().clone()
    }

    pub fn slow_pool(&self) -> Arc<ThreadPool> {
        self.slow_pool.clone()
    }

    pub fn is_slow_pool_enabled(&self) -> bool {
        self.enable_slow_pool.load(Ordering::SeqCst)
    }

    pub fn set_slow_pool_enabled(&self, enabled: bool) {
        self.enable_slow_pool.store(enabled, Ordering::SeqCst);
    }

    pub fn cancel_ratio(&self) -> f32 {
        f32::from_bits(self.cancel_ratio.load(Ordering::SeqCst))
    }

    pub fn set_cancel_ratio(&self, ratio: f32) {
        self.cancel_ratio.store(ratio.to_bits(), Ordering::SeqCst);
    }

    pub fn core_ratio(&self) -> f32 {
        f32::from_bits(self.core_ratio.load(Ordering::SeqCst))
    }

    pub fn set_core_ratio(&self, ratio: f32) {
        self.core_ratio.store(ratio.to_bits(), Ordering::SeqCst);
    }

    pub fn default_actives(&self) -> usize {
        self.default_actives
    }

    /// Rebuild the shared pool with changed sizes and drain the old one
    pub fn resize_shared_pool(
        &self,
        core_size: Option<usize>,
        max_size: Option<usize>,
        queue_capacity: Option<usize>,
    ) -> Result<()> {
        let old = {
            let mut guard = self.shared_pool.write();
            let spec = PoolSpec::new(
                SHARED_POOL_NAME,
                core_size.unwrap_or(guard.core_size()),
                max_size.unwrap_or(guard.max_size()),
                queue_capacity.unwrap_or(guard.queue_capacity()),
            );
            if guard.matches_spec(&spec) {
                return Ok(());
            }
            let replacement = Arc::new(ThreadPool::from_spec(&spec)?);
            info!(
                core_size = spec.core_size,
                max_size = spec.max_size,
                queue_capacity = spec.queue_capacity,
                "Replacing shared pool"
            );
            std::mem::replace(&mut *guard, replacement)
        };

        retire_pool(old);
        Ok(())
    }

    /// Drain every pool owned by the registry
    pub async fn shutdown(&self) {
        let mut pools = self.instantiated_pools();
        pools.push(self.shared_pool());
        pools.push(self.slow_pool());

        for pool in &pools {
            pool.shutdown();
        }
        for pool in pools {
            pool.shutdown_gracefully().await;
        }
    }
}

/// Stop a replaced pool from accepting work and drain it in the background
fn retire_pool(pool: Arc<ThreadPool>) {
    rpc_metrics::record_pool_retired(pool.name());
    pool.shutdown();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                pool.shutdown_gracefully().await;
            });
        }
        Err(_) => {
            warn!(pool = %pool.name(), "No runtime available, not waiting for retired pool to drain");
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RpcError::Config(format!("invalid value [{}] for {}", value, key)))
}

fn parse_positive_ratio(key: &str, value: &str) -> Result<f32> {
    let ratio: f32 = parse_value(key, value)?;
    if ratio > 0.0 && ratio.is_finite() {
        Ok(ratio)
    } else {
        Err(RpcError::Config(format!("ratio for {} must be positive, got {}", key, ratio)))
    }
}
