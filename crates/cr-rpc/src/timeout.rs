//! TimeoutWatcher - periodic scan of in-flight requests
//!
//! Each cycle:
//! - Flags requests past their budget (once, cooperatively; nothing is cancelled)
//! - Feeds the per-route slow classification
//! - Prunes expired slow records

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use cr_common::{current_time_millis, InvocationRequest};
use cr_config::TimeoutConfig;
use crate::context::InFlightRegistry;
use crate::rpc_metrics;

#[derive(Debug, Default)]
struct SlowRecord {
    /// Timeout instants inside the rolling window
    timeouts: VecDeque<u64>,
    slow_until: u64,
}

impl SlowRecord {
    fn trim(&mut self, window_start: u64) {
        while self.timeouts.front().is_some_and(|&at| at < window_start) {
            self.timeouts.pop_front();
        }
    }
}

pub struct TimeoutWatcher {
    in_flight: Arc<InFlightRegistry>,
    config: TimeoutConfig,
    slow_routes: DashMap<String, SlowRecord>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl TimeoutWatcher {
    pub fn new(in_flight: Arc<InFlightRegistry>, config: TimeoutConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            in_flight,
            config,
            slow_routes: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Spawn the scan loop. Calling again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let watcher = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.check_interval();

        info!(interval_ms = interval.as_millis() as u64, "Starting timeout watcher");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        watcher.scan_once(current_time_millis());
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Timeout watcher shutting down");
                        break;
                    }
                }
            }
            watcher.running.store(false, Ordering::SeqCst);
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scan cycle. Returns the number of requests newly flagged.
    pub fn scan_once(&self, now_millis: u64) -> usize {
        let default_budget = self.config.default_timeout_ms;
        let mut flagged = 0;

        for entry in self.in_flight.snapshot() {
            let request = &entry.request;
            if request.is_heartbeat() || request.create_millis_time() == 0 {
                continue;
            }

            let budget = if request.timeout_millis > 0 {
                request.timeout_millis
            } else {
                default_budget
            };
            let elapsed = entry.elapsed_millis(now_millis);
            if elapsed <= budget || !entry.context.mark_timed_out() {
                continue;
            }

            let route = request.route_key();
            warn!(
                route = %route,
                seq = request.seq,
                elapsed_ms = elapsed,
                budget_ms = budget,
                remote = %entry.context.channel().remote_address(),
                worker = ?entry.context.worker(),
                "Request exceeded its time budget"
            );
            rpc_metrics::record_request_timeout(&route);
            self.record_timeout(&route, now_millis);
            flagged += 1;
        }

        self.prune(now_millis);
        flagged
    }

    /// Count a timeout against `route` and classify it slow once the
    /// threshold is reached inside the window.
    pub fn record_timeout(&self, route: &str, now_millis: u64) {
        let window_start = now_millis.saturating_sub(self.config.slow_window_ms);
        let mut record = self.slow_routes.entry(route.to_string()).or_default();
        record.trim(window_start);
        record.timeouts.push_back(now_millis);

        if record.timeouts.len() >= self.config.slow_threshold.max(1) as usize {
            let newly_slow = record.slow_until <= now_millis;
            record.slow_until = now_millis + self.config.quarantine_ms;
            if newly_slow {
                info!(
                    route = %route,
                    timeouts = record.timeouts.len(),
                    quarantine_ms = self.config.quarantine_ms,
                    "Route classified as slow"
                );
            }
        }
    }

    fn prune(&self, now_millis: u64) {
        let window_start = now_millis.saturating_sub(self.config.slow_window_ms);
        self.slow_routes.retain(|route, record| {
            record.trim(window_start);
            let keep = !record.timeouts.is_empty() || record.slow_until > now_millis;
            if !keep {
                debug!(route = %route, "Dropping expired slow record");
            }
            keep
        });

        let slow = self
            .slow_routes
            .iter()
            .filter(|record| record.slow_until > now_millis)
            .count();
        rpc_metrics::set_slow_route_count(slow);
    }

    pub fn is_slow_request(&self, request: &InvocationRequest) -> bool {
        self.is_slow_route(&request.route_key(), current_time_millis())
    }

    pub fn is_slow_route(&self, route: &str, now_millis: u64) -> bool {
        self.slow_routes
            .get(route)
            .is_some_and(|record| record.slow_until > now_millis)
    }

    /// Routes currently classified slow
    pub fn slow_routes(&self) -> Vec<String> {
        let now = current_time_millis();
        let mut routes: Vec<String> = self
            .slow_routes
            .iter()
            .filter(|record| record.slow_until > now)
            .map(|record| record.key().clone())
            .collect();
        routes.sort();
        routes
    }
}
