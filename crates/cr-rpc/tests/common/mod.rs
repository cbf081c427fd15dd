#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use cr_common::InvocationRequest;
use cr_config::AppConfig;
use cr_rpc::{
    HandlerRegistry, InvocationHandler, PoolRegistry, ProviderContext, RequestDispatcher, Result,
    RpcServer,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Echoes the route and parameters back
pub struct EchoHandler;

#[async_trait]
impl InvocationHandler for EchoHandler {
    async fn handle(&self, request: &InvocationRequest, _context: &ProviderContext) -> Result<Value> {
        Ok(json!({
            "route": request.route_key(),
            "params": request.parameters.clone(),
        }))
    }
}

/// Holds every call until a permit is released for it
pub struct GatedHandler {
    pub release: Arc<Semaphore>,
}

impl GatedHandler {
    pub fn new() -> (Self, Arc<Semaphore>) {
        let release = Arc::new(Semaphore::new(0));
        (
            Self {
                release: release.clone(),
            },
            release,
        )
    }
}

#[async_trait]
impl InvocationHandler for GatedHandler {
    async fn handle(&self, request: &InvocationRequest, _context: &ProviderContext) -> Result<Value> {
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        Ok(Value::from(request.seq))
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.core_pool_size = 2;
    config.server.max_pool_size = 4;
    config.server.work_queue_size = 4;
    config
}

pub fn dispatcher_with(config: &AppConfig, handler: Arc<dyn InvocationHandler>) -> RequestDispatcher {
    let registry = Arc::new(PoolRegistry::new(&config.server, &config.pool));
    let handlers = Arc::new(HandlerRegistry::new().with_handler(cr_common::MessageType::Service, handler));
    RequestDispatcher::new(config, registry, handlers)
}

pub struct RunningServer {
    pub address: SocketAddr,
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<RequestDispatcher>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

pub async fn start_server(config: &AppConfig, handler: Arc<dyn InvocationHandler>) -> RunningServer {
    cr_common::logging::init_logging("cr-rpc-tests");
    let registry = Arc::new(PoolRegistry::new(&config.server, &config.pool));
    let handlers = Arc::new(HandlerRegistry::new().with_handler(cr_common::MessageType::Service, handler));
    let server = RpcServer::bind(config, registry.clone(), handlers).await.unwrap();

    let address = server.local_addr().unwrap();
    let dispatcher = server.dispatcher().clone();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    RunningServer {
        address,
        registry,
        dispatcher,
        shutdown,
        task,
    }
}
