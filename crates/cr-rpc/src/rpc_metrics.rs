//! Metrics for the RPC core
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a request admitted to a pool
pub fn record_request_submitted(pool: &str) {
    counter!(
        "courier_requests_submitted_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}

/// Record a request refused before reaching a handler
pub fn record_request_rejected(pool: &str, reason: &str) {
    counter!(
        "courier_requests_rejected_total",
        "pool" => pool.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record handler latency
pub fn record_invocation_latency(route: &str, success: bool, duration: Duration) {
    histogram!(
        "courier_invocation_duration_seconds",
        "route" => route.to_string(),
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a request flagged past its time budget
pub fn record_request_timeout(route: &str) {
    counter!(
        "courier_request_timeouts_total",
        "route" => route.to_string()
    )
    .increment(1);
}

/// Update in-flight request gauge
pub fn set_in_flight_count(count: usize) {
    gauge!("courier_in_flight_requests").set(count as f64);
}

/// Update slow route gauge
pub fn set_slow_route_count(count: usize) {
    gauge!("courier_slow_routes").set(count as f64);
}

/// Record a failed connect attempt
pub fn record_connect_failure(address: &str) {
    counter!(
        "courier_connect_failures_total",
        "address" => address.to_string()
    )
    .increment(1);
}

/// Record a failed write
pub fn record_write_failure(address: &str, reason: &str) {
    counter!(
        "courier_write_failures_total",
        "address" => address.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a failover retry onto another connection
pub fn record_failover(address: &str) {
    counter!(
        "courier_failover_total",
        "address" => address.to_string()
    )
    .increment(1);
}

/// Record a live pool being replaced or retired
pub fn record_pool_retired(pool: &str) {
    counter!(
        "courier_pools_retired_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}
