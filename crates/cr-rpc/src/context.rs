//! Provider-side request bookkeeping and the in-flight registry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use cr_common::{InvocationRequest, InvocationResponse, RequestId, TimePhase, TimePoint};
use crate::rpc_metrics;
use crate::Result;

/// Originating channel of an inbound request
pub trait ResponseSink: Send + Sync {
    /// Queue a response for the peer without waiting for it to be flushed
    fn write_response(&self, response: InvocationResponse) -> Result<()>;

    fn remote_address(&self) -> String;
}

/// Per-request callee state
pub struct ProviderContext {
    channel: Arc<dyn ResponseSink>,
    timeline: Mutex<Vec<TimePoint>>,
    worker: OnceLock<String>,
    timed_out: AtomicBool,
}

impl ProviderContext {
    pub fn new(channel: Arc<dyn ResponseSink>) -> Self {
        Self {
            channel,
            timeline: Mutex::new(Vec::with_capacity(4)),
            worker: OnceLock::new(),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &Arc<dyn ResponseSink> {
        &self.channel
    }

    pub fn record(&self, phase: TimePhase) {
        self.timeline.lock().push(TimePoint::now(phase));
    }

    pub fn timeline(&self) -> Vec<TimePoint> {
        self.timeline.lock().clone()
    }

    /// Millis of the first recorded point for `phase`
    pub fn time_of(&self, phase: TimePhase) -> Option<u64> {
        self.timeline
            .lock()
            .iter()
            .find(|point| point.phase == phase)
            .map(|point| point.at_millis)
    }

    /// Record the executing worker. Only the first call takes effect.
    pub fn set_worker(&self, worker: String) -> bool {
        self.worker.set(worker).is_ok()
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.get().map(String::as_str)
    }

    /// Flag the request as past its budget. Returns `true` only for the first call.
    pub fn mark_timed_out(&self) -> bool {
        !self.timed_out.swap(true, Ordering::SeqCst)
    }

    /// Cooperative cancellation hint for handlers
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("remote", &self.channel.remote_address())
            .field("worker", &self.worker.get())
            .field("timed_out", &self.is_timed_out())
            .finish()
    }
}

/// A request admitted to a pool and not yet finished
#[derive(Clone)]
pub struct InFlightEntry {
    pub request: Arc<InvocationRequest>,
    pub context: Arc<ProviderContext>,
}

impl InFlightEntry {
    /// Millis since the request was first stamped
    pub fn elapsed_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.request.create_millis_time())
    }
}

/// Concurrent `request identity -> context` map.
///
/// Entries are removed by exactly one [`InFlightGuard`].
#[derive(Default)]
pub struct InFlightRegistry {
    entries: DashMap<RequestId, InFlightEntry>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry; it is removed when the returned guard drops
    pub fn register(self: &Arc<Self>, entry: InFlightEntry) -> InFlightGuard {
        let id = entry.request.id();
        self.entries.insert(id, entry);
        rpc_metrics::set_in_flight_count(self.entries.len());
        InFlightGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: RequestId) -> Option<InFlightEntry> {
        self.entries.get(&id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy for scanning without holding shard locks
    pub fn snapshot(&self) -> Vec<InFlightEntry> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    fn remove(&self, id: RequestId) {
        if self.entries.remove(&id).is_some() {
            debug!(request_id = %id, "Removed in-flight request");
        }
        rpc_metrics::set_in_flight_count(self.entries.len());
    }
}

/// Removes its in-flight entry on drop, whatever the outcome of the request
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    id: RequestId,
}

impl InFlightGuard {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
