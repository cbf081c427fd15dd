use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod logging;

/// Current wall-clock time in epoch milliseconds.
pub fn current_time_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ============================================================================
// Endpoint
// ============================================================================

/// Remote `(host, port)` pair. Identity is the `host:port` string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` form used for connection identity and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Service,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Reply,
    Oneway,
}

/// Process-local identity of a request object.
///
/// Two requests with identical content still get distinct ids, so the
/// in-flight registry never conflates them. Not carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A call travelling from invoker to provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    #[serde(skip, default = "RequestId::next")]
    id: RequestId,
    /// Client-assigned correlation id, echoed back on the response
    pub seq: u64,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub message_type: MessageType,
    pub call_type: CallType,
    /// Caller time budget in milliseconds (0 = provider default)
    #[serde(default)]
    pub timeout_millis: u64,
    #[serde(default)]
    create_millis_time: u64,
}

impl InvocationRequest {
    /// A reply-expecting service call.
    pub fn service(
        seq: u64,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: RequestId::next(),
            seq,
            service_name: service_name.into(),
            method_name: method_name.into(),
            parameters,
            message_type: MessageType::Service,
            call_type: CallType::Reply,
            timeout_millis: 0,
            create_millis_time: 0,
        }
    }

    pub fn heartbeat(seq: u64) -> Self {
        Self {
            id: RequestId::next(),
            seq,
            service_name: String::new(),
            method_name: String::new(),
            parameters: serde_json::Value::Null,
            message_type: MessageType::Heartbeat,
            call_type: CallType::Reply,
            timeout_millis: 0,
            create_millis_time: 0,
        }
    }

    pub fn oneway(mut self) -> Self {
        self.call_type = CallType::Oneway;
        self
    }

    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn create_millis_time(&self) -> u64 {
        self.create_millis_time
    }

    /// Stamp the creation time if it has never been set.
    ///
    /// Returns `true` when this call performed the stamp.
    pub fn stamp_create_time(&mut self) -> bool {
        if self.create_millis_time != 0 {
            return false;
        }
        self.create_millis_time = current_time_millis();
        true
    }

    /// Routing key `service#method`
    pub fn route_key(&self) -> String {
        format!("{}#{}", self.service_name, self.method_name)
    }

    pub fn expects_reply(&self) -> bool {
        self.call_type == CallType::Reply
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MessageType::Heartbeat
    }
}

/// Classification of a failure carried on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Send never completed or the channel broke
    Transport,
    /// Provider pool saturated
    Rejected,
    /// Request failed validation before reaching a pool
    InvalidRequest,
    /// Handler returned an error or panicked
    Handler,
    /// No handler registered for the message type
    NoHandler,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    Success(serde_json::Value),
    Failure(FailureCause),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub seq: u64,
    pub message_type: MessageType,
    pub body: ResponseBody,
    #[serde(default)]
    pub created_millis: u64,
}

impl InvocationResponse {
    pub fn success(request: &InvocationRequest, value: serde_json::Value) -> Self {
        Self {
            seq: request.seq,
            message_type: request.message_type,
            body: ResponseBody::Success(value),
            created_millis: current_time_millis(),
        }
    }

    /// Failure response built locally, without a peer round trip.
    pub fn failure(request: &InvocationRequest, cause: FailureCause) -> Self {
        Self::failure_for(request.seq, request.message_type, cause)
    }

    /// Failure response for a request that is no longer at hand.
    pub fn failure_for(seq: u64, message_type: MessageType, cause: FailureCause) -> Self {
        Self {
            seq,
            message_type,
            body: ResponseBody::Failure(cause),
            created_millis: current_time_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, ResponseBody::Success(_))
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match &self.body {
            ResponseBody::Success(v) => Some(v),
            ResponseBody::Failure(_) => None,
        }
    }

    pub fn failure_cause(&self) -> Option<&FailureCause> {
        match &self.body {
            ResponseBody::Success(_) => None,
            ResponseBody::Failure(cause) => Some(cause),
        }
    }
}

// ============================================================================
// Timeline
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePhase {
    /// Accepted by the dispatcher
    Received,
    /// Handed to a pool
    Submitted,
    /// Picked up by a worker
    Started,
    /// Handler returned
    Completed,
}

#[derive(Debug, Clone, Copy)]
pub struct TimePoint {
    pub phase: TimePhase,
    pub at_millis: u64,
}

impl TimePoint {
    pub fn now(phase: TimePhase) -> Self {
        Self {
            phase,
            at_millis: current_time_millis(),
        }
    }
}

// ============================================================================
// Pool Types
// ============================================================================

/// Named pool shape, as pushed by live configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub pool_name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
}

impl PoolSpec {
    pub fn new(pool_name: impl Into<String>, core_size: usize, max_size: usize, queue_capacity: usize) -> Self {
        Self {
            pool_name: pool_name.into(),
            core_size,
            max_size,
            queue_capacity,
        }
    }

    /// Check the spec can build a pool.
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.pool_name.trim().is_empty() {
            return Err(CommonError::InvalidPoolSpec("pool name is blank".to_string()));
        }
        if self.max_size == 0 {
            return Err(CommonError::InvalidPoolSpec(format!(
                "pool [{}] has max size 0",
                self.pool_name
            )));
        }
        if self.core_size > self.max_size {
            return Err(CommonError::InvalidPoolSpec(format!(
                "pool [{}] core size {} exceeds max size {}",
                self.pool_name, self.core_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Point-in-time statistics of a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub pool_size: usize,
    pub active: usize,
    pub core_size: usize,
    pub max_size: usize,
    pub largest_pool_size: usize,
    pub task_count: u64,
    pub completed_task_count: u64,
    pub queue_size: usize,
    pub queue_remaining: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool-size:{}(active:{},core:{},max:{},largest:{}),task count:{}(completed:{}),queue size:{},queue remaining:{}",
            self.pool_size,
            self.active,
            self.core_size,
            self.max_size,
            self.largest_pool_size,
            self.task_count,
            self.completed_task_count,
            self.queue_size,
            self.queue_remaining,
        )
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("Invalid pool spec: {0}")]
    InvalidPoolSpec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
