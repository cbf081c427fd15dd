//! Courier RPC Core
//!
//! This crate provides the transport and dispatch core of a point-to-point RPC system:
//! - Connection: Client-side channel lifecycle, write path, failover and response correlation
//! - RequestDispatcher: Provider-side routing of requests onto worker pools
//! - PoolRegistry: Named pools and route tables, reconfigurable at runtime
//! - ThreadPool: Bounded worker pool with core/max sizing and a bounded queue
//! - TimeoutWatcher: In-flight scanning and slow-route quarantine
//! - RequestGate: Request validation and rate limiting ahead of the pools
//! - RpcServer: Minimal TCP acceptor feeding the dispatcher
//! - Wire: Length-prefixed JSON framing

pub mod callback;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod rpc_metrics;
pub mod server;
pub mod timeout;
pub mod wire;

pub use callback::{Callback, ResponseFuture};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionEvent, ConnectionEventKind, ConnectionSet,
    EventSink, HealthControl, NoOpEventSink,
};
pub use context::{InFlightEntry, InFlightGuard, InFlightRegistry, ProviderContext, ResponseSink};
pub use dispatcher::{MethodConfig, PendingResponse, RequestDispatcher, ServiceConfig};
pub use error::RpcError;
pub use gate::RequestGate;
pub use handler::{HandlerRegistry, HeartbeatHandler, InvocationHandler};
pub use pool::{current_worker, ThreadPool};
pub use registry::{PoolRegistry, SHARED_POOL_NAME, SLOW_POOL_NAME};
pub use server::{RpcServer, ServerChannel};
pub use timeout::TimeoutWatcher;

pub type Result<T> = std::result::Result<T, RpcError>;
