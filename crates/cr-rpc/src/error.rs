use cr_common::{FailureCause, FailureKind, PoolStats};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Channel unavailable for {0}")]
    ChannelUnavailable(String),

    #[error("Write queue full for {0}")]
    WriteQueueFull(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Request rejected by pool [{pool}]: {stats}")]
    Rejected { pool: String, stats: PoolStats },

    #[error("Pool shut down: {0}")]
    PoolShutdown(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("No handler for message type {0}")]
    NoHandler(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Response canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<cr_common::CommonError> for RpcError {
    fn from(err: cr_common::CommonError) -> Self {
        RpcError::Config(err.to_string())
    }
}

impl RpcError {
    /// Failure classification reported to the peer
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RpcError::Rejected { .. } | RpcError::RateLimited(_) | RpcError::PoolShutdown(_) => {
                FailureKind::Rejected
            }
            RpcError::InvalidRequest(_) => FailureKind::InvalidRequest,
            RpcError::NoHandler(_) => FailureKind::NoHandler,
            RpcError::ChannelUnavailable(_)
            | RpcError::WriteQueueFull(_)
            | RpcError::ConnectionClosed(_)
            | RpcError::ConnectFailed { .. }
            | RpcError::FrameTooLarge { .. }
            | RpcError::Canceled
            | RpcError::Io(_) => FailureKind::Transport,
            RpcError::Handler(_) | RpcError::Config(_) | RpcError::Serialization(_) => FailureKind::Handler,
        }
    }

    pub fn to_failure_cause(&self) -> FailureCause {
        FailureCause::new(self.failure_kind(), self.to_string())
    }
}
