use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use cr_common::{InvocationRequest, MessageType};
use crate::context::ProviderContext;
use crate::Result;

/// Executes one request of a given message type on a pool worker.
///
/// Service-method lookup and invocation live behind this trait.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn handle(&self, request: &InvocationRequest, context: &ProviderContext) -> Result<Value>;
}

/// Answers heartbeats with the echoed sequence number
pub struct HeartbeatHandler;

#[async_trait]
impl InvocationHandler for HeartbeatHandler {
    async fn handle(&self, request: &InvocationRequest, _context: &ProviderContext) -> Result<Value> {
        Ok(Value::from(request.seq))
    }
}

/// Handler lookup by message type
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, Arc<dyn InvocationHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Registry with the built-in heartbeat handler
    pub fn new() -> Self {
        let handlers: DashMap<MessageType, Arc<dyn InvocationHandler>> = DashMap::new();
        handlers.insert(MessageType::Heartbeat, Arc::new(HeartbeatHandler));
        Self { handlers }
    }

    /// Registry with no handlers at all
    pub fn empty() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, message_type: MessageType, handler: Arc<dyn InvocationHandler>) {
        self.handlers.insert(message_type, handler);
    }

    pub fn with_handler(self, message_type: MessageType, handler: Arc<dyn InvocationHandler>) -> Self {
        self.register(message_type, handler);
        self
    }

    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers.get(&message_type).map(|h| h.value().clone())
    }
}
