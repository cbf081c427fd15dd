//! RequestDispatcher - routes inbound requests onto worker pools
//!
//! Pool resolution order:
//! 1. Static per-method pool (`service#method`)
//! 2. Static per-service pool
//! 3. Live-config method route
//! 4. Live-config service route (only when no method route exists)
//! 5. Slow pool, when enabled and the route is classified slow
//! 6. Default pool for the configured strategy

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use cr_common::{InvocationRequest, InvocationResponse, PoolSpec, TimePhase};
use cr_config::{AppConfig, PoolStrategy};
use crate::callback::{Callback, ResponseFuture};
use crate::context::{InFlightEntry, InFlightGuard, InFlightRegistry, ProviderContext};
use crate::error::RpcError;
use crate::gate::RequestGate;
use crate::handler::HandlerRegistry;
use crate::pool::{self, ThreadPool};
use crate::registry::PoolRegistry;
use crate::rpc_metrics;
use crate::timeout::TimeoutWatcher;
use crate::Result;

/// Resolves once the handler has produced a response
pub type PendingResponse = ResponseFuture;

/// Static pool settings for one exported service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_name: String,
    /// `false` gives the service standalone pools under any strategy
    pub use_shared_pool: bool,
    /// Service-wide concurrency, used when no methods are configured
    pub actives: usize,
    /// Explicit service pool, wins over `actives`
    pub pool: Option<PoolSpec>,
    pub methods: Vec<MethodConfig>,
}

#[derive(Debug, Clone)]
pub struct MethodConfig {
    pub method_name: String,
    /// 0 uses the default actives
    pub actives: usize,
    pub pool: Option<PoolSpec>,
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            use_shared_pool: true,
            actives: 0,
            pool: None,
            methods: Vec::new(),
        }
    }

    pub fn standalone(mut self) -> Self {
        self.use_shared_pool = false;
        self
    }

    pub fn with_actives(mut self, actives: usize) -> Self {
        self.actives = actives;
        self
    }

    pub fn with_pool(mut self, spec: PoolSpec) -> Self {
        self.pool = Some(spec);
        self
    }

    pub fn with_method(mut self, method_name: impl Into<String>, actives: usize) -> Self {
        self.methods.push(MethodConfig {
            method_name: method_name.into(),
            actives,
            pool: None,
        });
        self
    }

    pub fn with_method_pool(mut self, method_name: impl Into<String>, spec: PoolSpec) -> Self {
        self.methods.push(MethodConfig {
            method_name: method_name.into(),
            actives: 0,
            pool: Some(spec),
        });
        self
    }
}

pub struct RequestDispatcher {
    strategy: PoolStrategy,
    /// Present only under the `server` strategy
    server_pool: Option<Arc<ThreadPool>>,
    registry: Arc<PoolRegistry>,
    handlers: Arc<HandlerRegistry>,
    in_flight: Arc<InFlightRegistry>,
    watcher: Arc<TimeoutWatcher>,
    gate: RequestGate,
    service_pools: DashMap<String, Arc<ThreadPool>>,
    method_pools: DashMap<String, Arc<ThreadPool>>,
    /// Serializes add/remove of static services
    services_lock: Mutex<()>,
}

impl RequestDispatcher {
    pub fn new(config: &AppConfig, registry: Arc<PoolRegistry>, handlers: Arc<HandlerRegistry>) -> Self {
        let strategy = config.server.pool_strategy;
        let server_pool = (strategy == PoolStrategy::Server).then(|| {
            Arc::new(ThreadPool::new(
                format!("server-{}", config.server.port),
                config.server.core_pool_size,
                config.server.max_pool_size,
                config.server.work_queue_size,
            ))
        });
        let in_flight = Arc::new(InFlightRegistry::new());
        let watcher = Arc::new(TimeoutWatcher::new(in_flight.clone(), config.timeout.clone()));

        info!(
            strategy = ?strategy,
            slow_pool = registry.is_slow_pool_enabled(),
            "Creating request dispatcher"
        );

        Self {
            strategy,
            server_pool,
            registry,
            handlers,
            in_flight,
            watcher,
            gate: RequestGate::from_rate(config.server.rate_limit_per_second),
            service_pools: DashMap::new(),
            method_pools: DashMap::new(),
            services_lock: Mutex::new(()),
        }
    }

    pub fn with_gate(mut self, gate: RequestGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn in_flight(&self) -> &Arc<InFlightRegistry> {
        &self.in_flight
    }

    pub fn timeout_watcher(&self) -> &Arc<TimeoutWatcher> {
        &self.watcher
    }

    /// Start the timeout watcher
    pub fn start(&self) {
        self.watcher.start();
    }

    /// Stop the timeout watcher and drain pools owned by this dispatcher.
    /// Registry pools are left to their owner.
    pub async fn stop(&self) {
        self.watcher.stop();

        let mut pools: Vec<Arc<ThreadPool>> = self.server_pool.iter().cloned().collect();
        pools.extend(self.service_pools.iter().map(|p| p.value().clone()));
        pools.extend(self.method_pools.iter().map(|p| p.value().clone()));
        for pool in &pools {
            pool.shutdown();
        }
        for pool in pools {
            pool.shutdown_gracefully().await;
        }
        info!("Request dispatcher stopped");
    }

    /// Pool used when nothing more specific applies
    pub fn default_pool(&self) -> Arc<ThreadPool> {
        match &self.server_pool {
            Some(pool) => pool.clone(),
            None => self.registry.shared_pool(),
        }
    }

    pub fn resolve_pool(&self, request: &InvocationRequest) -> Arc<ThreadPool> {
        if let Some(pool) = self.method_pools.get(&request.route_key()) {
            return pool.value().clone();
        }
        if let Some(pool) = self.service_pools.get(&request.service_name) {
            return pool.value().clone();
        }
        if let Some(pool) = self.registry.resolve(request) {
            return pool;
        }
        if self.registry.is_slow_pool_enabled() && self.watcher.is_slow_request(request) {
            return self.registry.slow_pool();
        }
        self.default_pool()
    }

    /// Whether the pool this request would land on is loaded past the cancel ratio
    pub fn need_cancel_request(&self, request: &InvocationRequest) -> bool {
        let pool = self.resolve_pool(request);
        let threshold = pool.max_size() as f64 * self.registry.cancel_ratio() as f64;
        pool.pool_size() as f64 >= threshold
    }

    /// Validate, resolve and submit a request.
    ///
    /// On rejection the in-flight entry is gone before the error is returned.
    pub fn dispatch(&self, mut request: InvocationRequest, context: ProviderContext) -> Result<PendingResponse> {
        request.stamp_create_time();
        context.record(TimePhase::Received);

        if let Err(e) = self.gate.check(&request) {
            let reason = match &e {
                RpcError::RateLimited(_) => "rate_limited",
                _ => "invalid",
            };
            rpc_metrics::record_request_rejected("gate", reason);
            return Err(e);
        }

        let pool = self.resolve_pool(&request);
        self.admit(pool, Arc::new(request), Arc::new(context))
    }

    /// Submit to `pool`. A pool retired between resolution and submit is
    /// resolved again once, since a live push may have replaced it.
    fn admit(
        &self,
        pool: Arc<ThreadPool>,
        request: Arc<InvocationRequest>,
        context: Arc<ProviderContext>,
    ) -> Result<PendingResponse> {
        let (pool, outcome) = match self.submit_to(&pool, &request, &context) {
            Err(RpcError::PoolShutdown(name)) => {
                let current = self.resolve_pool(&request);
                if Arc::ptr_eq(&current, &pool) {
                    (pool, Err(RpcError::PoolShutdown(name)))
                } else {
                    debug!(
                        route = %request.route_key(),
                        seq = request.seq,
                        retired = %name,
                        pool = %current.name(),
                        "Pool retired during dispatch, resubmitting"
                    );
                    let outcome = self.submit_to(&current, &request, &context);
                    (current, outcome)
                }
            }
            outcome => (pool, outcome),
        };

        match outcome {
            Ok(pending) => {
                rpc_metrics::record_request_submitted(pool.name());
                Ok(pending)
            }
            Err(e) => {
                rpc_metrics::record_request_rejected(pool.name(), "saturated");
                warn!(
                    route = %request.route_key(),
                    seq = request.seq,
                    pool = %pool.name(),
                    error = %e,
                    "Request rejected"
                );
                Err(e)
            }
        }
    }

    /// One submit attempt. On error the task is dropped with its guard, so
    /// the in-flight entry is already gone.
    fn submit_to(
        &self,
        pool: &Arc<ThreadPool>,
        request: &Arc<InvocationRequest>,
        context: &Arc<ProviderContext>,
    ) -> Result<PendingResponse> {
        let guard = self.in_flight.register(InFlightEntry {
            request: request.clone(),
            context: context.clone(),
        });
        let (callback, pending) = Callback::new();

        debug!(
            route = %request.route_key(),
            seq = request.seq,
            pool = %pool.name(),
            "Submitting request"
        );
        context.record(TimePhase::Submitted);

        let task = invoke(self.handlers.clone(), request.clone(), context.clone(), guard, callback);
        pool.submit(task)?;
        Ok(pending)
    }

    /// Dispatch a request and report failures to the originating channel.
    ///
    /// Returns `None` when the request never reached a handler.
    pub fn process_request(&self, request: InvocationRequest, context: ProviderContext) -> Option<PendingResponse> {
        let seq = request.seq;
        let message_type = request.message_type;
        let reply_on_failure = request.expects_reply() && !request.is_heartbeat();
        let channel = context.channel().clone();

        match self.dispatch(request, context) {
            Ok(pending) => Some(pending),
            Err(e) => {
                if reply_on_failure {
                    let response = InvocationResponse::failure_for(seq, message_type, e.to_failure_cause());
                    if let Err(write_err) = channel.write_response(response) {
                        warn!(
                            seq = seq,
                            remote = %channel.remote_address(),
                            error = %write_err,
                            "Failed to write failure response"
                        );
                    }
                }
                None
            }
        }
    }

    fn needs_standalone_pool(&self, config: &ServiceConfig) -> bool {
        !config.use_shared_pool || self.strategy == PoolStrategy::Method
    }

    /// Create the static pools for a service
    pub fn add_service(&self, config: &ServiceConfig) {
        let _lock = self.services_lock.lock();
        if !self.needs_standalone_pool(config) {
            return;
        }

        let service = &config.service_name;
        let core_ratio = self.registry.core_ratio();

        if config.methods.is_empty() {
            if self.service_pools.contains_key(service) {
                return;
            }
            let pool = match &config.pool {
                Some(spec) => ThreadPool::from_spec(spec),
                None if config.actives > 0 => Ok(sized_pool(service.clone(), config.actives, core_ratio)),
                None => return,
            };
            match pool {
                Ok(pool) => {
                    info!(service = %service, pool = %pool.name(), "Created service pool");
                    self.service_pools.insert(service.clone(), Arc::new(pool));
                }
                Err(e) => error!(service = %service, error = %e, "Invalid service pool config"),
            }
            return;
        }

        for method in &config.methods {
            let key = format!("{}#{}", service, method.method_name);
            if self.method_pools.contains_key(&key) {
                continue;
            }
            let pool = match &method.pool {
                Some(spec) => ThreadPool::from_spec(spec),
                None => {
                    let actives = if method.actives > 0 {
                        method.actives
                    } else {
                        self.registry.default_actives()
                    };
                    Ok(sized_pool(key.clone(), actives, core_ratio))
                }
            };
            match pool {
                Ok(pool) => {
                    info!(route = %key, pool = %pool.name(), "Created method pool");
                    self.method_pools.insert(key, Arc::new(pool));
                }
                Err(e) => error!(route = %key, error = %e, "Invalid method pool config"),
            }
        }
    }

    /// Retire the static pools of a service
    pub fn remove_service(&self, config: &ServiceConfig) {
        let _lock = self.services_lock.lock();
        if !self.needs_standalone_pool(config) {
            return;
        }

        let prefix = format!("{}#", config.service_name);
        let keys: Vec<String> = self
            .method_pools
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, pool)) = self.method_pools.remove(&key) {
                pool.shutdown();
            }
        }
        if let Some((_, pool)) = self.service_pools.remove(&config.service_name) {
            pool.shutdown();
        }
        info!(service = %config.service_name, "Removed service pools");
    }

    /// Statistics of the pool a request would land on
    pub fn get_request_statistics(&self, request: &InvocationRequest) -> String {
        self.resolve_pool(request).stats().to_string()
    }

    /// `[label=stats]` segments for every pool, comma-joined
    pub fn get_statistics(&self) -> String {
        let mut segments = Vec::new();

        match &self.server_pool {
            Some(pool) => segments.push(format!("[server={}]", pool.stats())),
            None => segments.push(format!("[shared={}]", self.registry.shared_pool().stats())),
        }
        segments.push(format!("[slow={}]", self.registry.slow_pool().stats()));

        for pools in [&self.service_pools, &self.method_pools] {
            let mut entries: Vec<(String, Arc<ThreadPool>)> = pools
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, pool) in entries {
                segments.push(format!("[{}={}]", key, pool.stats()));
            }
        }

        for pool in self.registry.instantiated_pools() {
            segments.push(format!("[{}={}]", pool.name(), pool.stats()));
        }

        segments.join(",")
    }
}

/// Pool sized from a concurrency figure: `max = queue = actives`,
/// `core = actives / core_ratio`, or `actives` when that rounds to zero.
fn sized_pool(name: String, actives: usize, core_ratio: f32) -> ThreadPool {
    let core = (actives as f32 / core_ratio) as usize;
    let core = if core > 0 { core } else { actives };
    ThreadPool::new(name, core, actives, actives)
}

async fn invoke(
    handlers: Arc<HandlerRegistry>,
    request: Arc<InvocationRequest>,
    context: Arc<ProviderContext>,
    guard: InFlightGuard,
    callback: Callback,
) {
    context.record(TimePhase::Started);
    if let Some(worker) = pool::current_worker() {
        context.set_worker(worker);
    }

    let route = request.route_key();
    let started = Instant::now();
    let outcome = match handlers.get(request.message_type) {
        Some(handler) => AssertUnwindSafe(handler.handle(&request, &context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RpcError::Handler(panic_message(panic.as_ref())))),
        None => Err(RpcError::NoHandler(format!("{:?}", request.message_type))),
    };
    context.record(TimePhase::Completed);
    rpc_metrics::record_invocation_latency(&route, outcome.is_ok(), started.elapsed());

    let response = match outcome {
        Ok(value) => InvocationResponse::success(&request, value),
        Err(e) => {
            error!(
                route = %route,
                seq = request.seq,
                worker = ?context.worker(),
                error = %e,
                "Invocation handler failed outside its own error handling"
            );
            InvocationResponse::failure(&request, e.to_failure_cause())
        }
    };
    drop(guard);

    if request.expects_reply() {
        if let Err(e) = context.channel().write_response(response.clone()) {
            warn!(
                route = %route,
                seq = request.seq,
                remote = %context.channel().remote_address(),
                error = %e,
                "Failed to write response"
            );
        }
    }
    callback.complete(response);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::RecordingSink;
    use crate::handler::InvocationHandler;
    use async_trait::async_trait;
    use cr_common::{FailureKind, MessageType};
    use serde_json::Value;

    struct EchoHandler;

    #[async_trait]
    impl InvocationHandler for EchoHandler {
        async fn handle(&self, request: &InvocationRequest, _context: &ProviderContext) -> Result<Value> {
            Ok(request.parameters.clone())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl InvocationHandler for PanicHandler {
        async fn handle(&self, _request: &InvocationRequest, _context: &ProviderContext) -> Result<Value> {
            panic!("broken handler")
        }
    }

    fn dispatcher(strategy: PoolStrategy, handler: Arc<dyn InvocationHandler>) -> RequestDispatcher {
        let mut config = AppConfig::default();
        config.server.pool_strategy = strategy;
        config.server.core_pool_size = 2;
        config.server.max_pool_size = 4;
        config.server.work_queue_size = 4;
        let registry = Arc::new(PoolRegistry::new(&config.server, &config.pool));
        let handlers = Arc::new(HandlerRegistry::new().with_handler(MessageType::Service, handler));
        RequestDispatcher::new(&config, registry, handlers)
    }

    #[tokio::test]
    async fn test_dispatch_writes_reply_and_clears_registry() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        let sink = Arc::new(RecordingSink::default());
        let request = InvocationRequest::service(5, "S", "echo", serde_json::json!({"a": 1}));

        let response = dispatcher
            .dispatch(request, ProviderContext::new(sink.clone()))
            .unwrap()
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.value(), Some(&serde_json::json!({"a": 1})));
        assert!(dispatcher.in_flight().is_empty());
        let written = sink.responses.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].seq, 5);
    }

    #[tokio::test]
    async fn test_oneway_request_writes_nothing() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        let sink = Arc::new(RecordingSink::default());
        let request = InvocationRequest::service(6, "S", "echo", Value::Null).oneway();

        dispatcher
            .dispatch(request, ProviderContext::new(sink.clone()))
            .unwrap()
            .await
            .unwrap();
        assert!(sink.responses.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure_response() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(PanicHandler));
        let sink = Arc::new(RecordingSink::default());
        let request = InvocationRequest::service(7, "S", "boom", Value::Null);

        let response = dispatcher
            .dispatch(request, ProviderContext::new(sink.clone()))
            .unwrap()
            .await
            .unwrap();

        let cause = response.failure_cause().unwrap();
        assert_eq!(cause.kind, FailureKind::Handler);
        assert!(cause.message.contains("broken handler"));
        assert!(dispatcher.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_missing_handler_reported() {
        let config = AppConfig::default();
        let registry = Arc::new(PoolRegistry::new(&config.server, &config.pool));
        let dispatcher = RequestDispatcher::new(&config, registry, Arc::new(HandlerRegistry::new()));
        let sink = Arc::new(RecordingSink::default());

        let response = dispatcher
            .dispatch(
                InvocationRequest::service(8, "S", "m", Value::Null),
                ProviderContext::new(sink),
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response.failure_cause().unwrap().kind, FailureKind::NoHandler);
    }

    #[tokio::test]
    async fn test_invalid_request_answered_synchronously() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        let sink = Arc::new(RecordingSink::default());

        let pending = dispatcher.process_request(
            InvocationRequest::service(9, "", "m", Value::Null),
            ProviderContext::new(sink.clone()),
        );
        assert!(pending.is_none());

        let written = sink.responses.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].seq, 9);
        assert_eq!(written[0].failure_cause().unwrap().kind, FailureKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_heartbeat_uses_builtin_handler() {
        let dispatcher = dispatcher(PoolStrategy::Server, Arc::new(EchoHandler));
        let sink = Arc::new(RecordingSink::default());
        let response = dispatcher
            .dispatch(InvocationRequest::heartbeat(10), ProviderContext::new(sink))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response.message_type, MessageType::Heartbeat);
        assert_eq!(response.value(), Some(&Value::from(10u64)));
    }

    #[test]
    fn test_default_pool_follows_strategy() {
        let shared = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        assert_eq!(shared.default_pool().name(), "shared");
        assert!(shared.get_statistics().starts_with("[shared=pool-size:0("));

        let server = dispatcher(PoolStrategy::Server, Arc::new(EchoHandler));
        assert_eq!(server.default_pool().name(), "server-4040");
        let stats = server.get_statistics();
        assert!(stats.starts_with("[server="));
        assert!(stats.contains(",[slow="));
    }

    #[test]
    fn test_static_service_pools() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));

        // Shared services get no standalone pools under the shared strategy
        dispatcher.add_service(&ServiceConfig::new("Plain").with_actives(9));
        let plain = InvocationRequest::service(1, "Plain", "m", Value::Null);
        assert_eq!(dispatcher.resolve_pool(&plain).name(), "shared");

        let orders = ServiceConfig::new("Orders").standalone().with_actives(9);
        dispatcher.add_service(&orders);
        let pool = dispatcher.resolve_pool(&InvocationRequest::service(2, "Orders", "get", Value::Null));
        assert_eq!(pool.name(), "Orders");
        assert_eq!(pool.core_size(), 3);
        assert_eq!(pool.max_size(), 9);
        assert_eq!(pool.queue_capacity(), 9);

        let users = ServiceConfig::new("Users")
            .standalone()
            .with_method("find", 0)
            .with_method("save", 2);
        dispatcher.add_service(&users);
        let find = dispatcher.resolve_pool(&InvocationRequest::service(3, "Users", "find", Value::Null));
        assert_eq!(find.name(), "Users#find");
        assert_eq!(find.max_size(), 60);
        assert_eq!(find.core_size(), 20);
        let save = dispatcher.resolve_pool(&InvocationRequest::service(4, "Users", "save", Value::Null));
        // 2 / 3.0 rounds to zero, so core falls back to actives
        assert_eq!(save.core_size(), 2);
        let other = dispatcher.resolve_pool(&InvocationRequest::service(5, "Users", "other", Value::Null));
        assert_eq!(other.name(), "shared");

        let stats = dispatcher.get_statistics();
        assert!(stats.contains(",[Orders=pool-size:0("));
        assert!(stats.contains(",[Users#find="));

        dispatcher.remove_service(&users);
        assert!(find.is_shutdown());
        let find_again = dispatcher.resolve_pool(&InvocationRequest::service(6, "Users", "find", Value::Null));
        assert_eq!(find_again.name(), "shared");
    }

    #[test]
    fn test_slow_route_uses_slow_pool() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        let request = InvocationRequest::service(1, "S", "slow", Value::Null);
        let now = cr_common::current_time_millis();
        for i in 0..3 {
            dispatcher.timeout_watcher().record_timeout("S#slow", now + i);
        }
        assert_eq!(dispatcher.resolve_pool(&request).name(), "slow");

        dispatcher.registry().set_slow_pool_enabled(false);
        assert_eq!(dispatcher.resolve_pool(&request).name(), "shared");
    }

    #[tokio::test]
    async fn test_retired_pool_resubmits_to_current() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        let sink = Arc::new(RecordingSink::default());
        let request = Arc::new(InvocationRequest::service(8, "S", "m", serde_json::json!([8])));
        let stale = Arc::new(ThreadPool::new("stale", 1, 1, 1));
        stale.shutdown();

        let pending = dispatcher
            .admit(stale.clone(), request, Arc::new(ProviderContext::new(sink.clone())))
            .unwrap();
        let response = pending.await.unwrap();

        assert!(response.is_success());
        assert_eq!(stale.stats().task_count, 0);
        assert_eq!(dispatcher.registry().shared_pool().stats().task_count, 1);
        assert!(dispatcher.in_flight().is_empty());
        assert_eq!(sink.responses.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_shut_down_current_pool_still_rejects() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler));
        dispatcher.registry().shared_pool().shutdown();
        let sink = Arc::new(RecordingSink::default());

        let result = dispatcher.dispatch(
            InvocationRequest::service(9, "S", "m", Value::Null),
            ProviderContext::new(sink),
        );
        assert!(matches!(result, Err(RpcError::PoolShutdown(_))));
        assert!(dispatcher.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_custom_gate_rate_limits_dispatch() {
        let dispatcher = dispatcher(PoolStrategy::Shared, Arc::new(EchoHandler))
            .with_gate(RequestGate::with_rate_limit(nonzero_ext::nonzero!(1u32)));
        let sink = Arc::new(RecordingSink::default());

        let first = dispatcher
            .process_request(
                InvocationRequest::service(1, "S", "m", Value::Null),
                ProviderContext::new(sink.clone()),
            )
            .unwrap();
        assert!(first.await.unwrap().is_success());

        let second = dispatcher.process_request(
            InvocationRequest::service(2, "S", "m", Value::Null),
            ProviderContext::new(sink.clone()),
        );
        assert!(second.is_none());

        let written = sink.responses.lock();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].seq, 2);
        assert_eq!(written[1].failure_cause().unwrap().kind, FailureKind::Rejected);
    }

    #[test]
    fn test_request_statistics_follow_resolution() {
        let dispatcher = dispatcher(PoolStrategy::Server, Arc::new(EchoHandler));
        let request = InvocationRequest::service(1, "S", "m", Value::Null);
        let stats = dispatcher.get_request_statistics(&request);
        assert!(stats.starts_with("pool-size:0("));
        assert_eq!(stats, dispatcher.default_pool().stats().to_string());
    }
}
