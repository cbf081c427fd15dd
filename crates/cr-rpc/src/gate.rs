//! Admission gate checked before a request reaches any pool

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::debug;

use cr_common::{InvocationRequest, MessageType};
use crate::error::RpcError;
use crate::Result;

/// Structural validation plus an optional process-wide rate limit
pub struct RequestGate {
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestGate {
    /// Gate with validation only
    pub fn new() -> Self {
        Self { rate_limiter: None }
    }

    pub fn with_rate_limit(per_second: NonZeroU32) -> Self {
        Self {
            rate_limiter: Some(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    /// `0` disables the rate limit
    pub fn from_rate(per_second: u32) -> Self {
        NonZeroU32::new(per_second)
            .map(Self::with_rate_limit)
            .unwrap_or_default()
    }

    pub fn check(&self, request: &InvocationRequest) -> Result<()> {
        if request.message_type == MessageType::Service {
            if request.service_name.trim().is_empty() {
                return Err(RpcError::InvalidRequest(format!(
                    "request seq {} has no service name",
                    request.seq
                )));
            }
            if request.method_name.trim().is_empty() {
                return Err(RpcError::InvalidRequest(format!(
                    "request seq {} to {} has no method name",
                    request.seq, request.service_name
                )));
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                debug!(route = %request.route_key(), "Request rate limit exceeded");
                return Err(RpcError::RateLimited(request.route_key()));
            }
        }

        Ok(())
    }
}
