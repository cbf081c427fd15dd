//! ThreadPool - bounded worker pool on tokio tasks
//!
//! Admission follows the classic executor order:
//! - Below core size, a new worker is started with the task as its first job
//! - Otherwise the task is queued while the queue has room
//! - Otherwise a worker is added up to max size
//! - Otherwise the task is rejected immediately
//!
//! A queue capacity of 0 behaves as a direct hand-off: a task is only queued
//! when an idle worker is waiting to take it.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use cr_common::{PoolSpec, PoolStats};
use crate::error::RpcError;
use crate::Result;

/// Idle time after which workers above core size retire
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Upper bound on waiting for a pool to drain during shutdown
pub const SHUTDOWN_AWAIT: Duration = Duration::from_secs(5);

type Job = BoxFuture<'static, ()>;

tokio::task_local! {
    static WORKER_NAME: Arc<str>;
}

/// Name of the pool worker running the current task, if any.
pub fn current_worker() -> Option<String> {
    WORKER_NAME.try_with(|name| name.to_string()).ok()
}

struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    /// Workers parked waiting for a job
    idle: usize,
    /// Workers currently running a job
    active: usize,
    largest: usize,
    task_count: u64,
    completed: u64,
    shutdown: bool,
    next_worker_id: u64,
}

struct Shared {
    name: String,
    core_size: usize,
    max_size: usize,
    queue_capacity: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    work_available: Notify,
    terminated: Notify,
}

enum NextStep {
    Run(Job),
    Wait,
    Exit,
}

/// Named worker pool with a bounded queue and bounded worker count
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, core_size: usize, max_size: usize, queue_capacity: usize) -> Self {
        Self::with_keep_alive(name, core_size, max_size, queue_capacity, DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(
        name: impl Into<String>,
        core_size: usize,
        max_size: usize,
        queue_capacity: usize,
        keep_alive: Duration,
    ) -> Self {
        let name = name.into();
        let max_size = max_size.max(1);
        let core_size = core_size.min(max_size);

        debug!(
            pool = %name,
            core_size = core_size,
            max_size = max_size,
            queue_capacity = queue_capacity,
            "Creating thread pool"
        );

        Self {
            shared: Arc::new(Shared {
                name,
                core_size,
                max_size,
                queue_capacity,
                keep_alive,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    active: 0,
                    largest: 0,
                    task_count: 0,
                    completed: 0,
                    shutdown: false,
                    next_worker_id: 0,
                }),
                work_available: Notify::new(),
                terminated: Notify::new(),
            }),
        }
    }

    /// Build a pool from a validated spec
    pub fn from_spec(spec: &PoolSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self::new(
            spec.pool_name.clone(),
            spec.core_size,
            spec.max_size,
            spec.queue_capacity,
        ))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn core_size(&self) -> usize {
        self.shared.core_size
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue_capacity
    }

    /// Current number of workers
    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Whether this pool was built with exactly the given shape
    pub fn matches_spec(&self, spec: &PoolSpec) -> bool {
        self.shared.name == spec.pool_name
            && self.shared.core_size == spec.core_size
            && self.shared.max_size == spec.max_size
            && self.shared.queue_capacity == spec.queue_capacity
    }

    /// Submit a task. Rejection is immediate; the task is dropped before
    /// the error is returned.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(task);
        let mut state = self.shared.state.lock();

        if state.shutdown {
            drop(state);
            drop(job);
            return Err(RpcError::PoolShutdown(self.shared.name.clone()));
        }

        if state.workers < self.shared.core_size {
            state.task_count += 1;
            self.spawn_worker(&mut state, Some(job));
            return Ok(());
        }

        if state.queue.len() < self.shared.queue_capacity + state.idle {
            state.task_count += 1;
            state.queue.push_back(job);
            drop(state);
            self.shared.work_available.notify_one();
            return Ok(());
        }

        if state.workers < self.shared.max_size {
            state.task_count += 1;
            self.spawn_worker(&mut state, Some(job));
            return Ok(());
        }

        let stats = snapshot(&self.shared, &state);
        drop(state);
        drop(job);
        Err(RpcError::Rejected {
            pool: self.shared.name.clone(),
            stats,
        })
    }

    fn spawn_worker(&self, state: &mut PoolState, first: Option<Job>) {
        state.workers += 1;
        state.largest = state.largest.max(state.workers);
        state.next_worker_id += 1;

        let worker_name: Arc<str> = Arc::from(format!("{}-worker-{}", self.shared.name, state.next_worker_id));
        let shared = self.shared.clone();
        tokio::spawn(WORKER_NAME.scope(worker_name, worker_loop(shared, first)));
    }

    /// Live statistics snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        snapshot(&self.shared, &state)
    }

    /// Stop accepting tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        let already = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.shutdown, true)
        };
        if !already {
            info!(pool = %self.shared.name, "Shutting down thread pool");
        }
        self.shared.work_available.notify_waiters();
        if self.is_terminated() {
            self.shared.terminated.notify_waiters();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Shut down and no workers remain
    pub fn is_terminated(&self) -> bool {
        let state = self.shared.state.lock();
        state.shutdown && state.workers == 0
    }

    /// Wait until all workers have exited, at most `timeout` (capped at 5 s).
    /// Returns `false` when the wait was abandoned.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout.min(SHUTDOWN_AWAIT);
        loop {
            let notified = self.shared.terminated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_terminated() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_terminated();
            }
        }
    }

    /// Shut down and wait for in-flight work, logging if the wait is abandoned.
    pub async fn shutdown_gracefully(&self) -> bool {
        self.shutdown();
        let drained = self.await_termination(SHUTDOWN_AWAIT).await;
        if !drained {
            warn!(
                pool = %self.shared.name,
                stats = %self.stats(),
                "Thread pool did not drain within shutdown timeout, abandoning"
            );
        }
        drained
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.shared.name)
            .field("core_size", &self.shared.core_size)
            .field("max_size", &self.shared.max_size)
            .field("queue_capacity", &self.shared.queue_capacity)
            .finish()
    }
}

fn snapshot(shared: &Shared, state: &PoolState) -> PoolStats {
    let queue_size = state.queue.len();
    PoolStats {
        pool_name: shared.name.clone(),
        pool_size: state.workers,
        active: state.active,
        core_size: shared.core_size,
        max_size: shared.max_size,
        largest_pool_size: state.largest,
        task_count: state.task_count,
        completed_task_count: state.completed,
        queue_size,
        queue_remaining: shared.queue_capacity - queue_size.min(shared.queue_capacity),
    }
}

async fn worker_loop(shared: Arc<Shared>, first: Option<Job>) {
    let mut next = first;

    loop {
        if let Some(job) = next.take() {
            run_job(&shared, job).await;
        }

        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match take_next(&shared) {
            NextStep::Run(job) => {
                next = Some(job);
                continue;
            }
            NextStep::Exit => return,
            NextStep::Wait => {}
        }

        let timed_out = tokio::time::timeout(shared.keep_alive, notified).await.is_err();

        match after_wait(&shared, timed_out) {
            NextStep::Run(job) => next = Some(job),
            NextStep::Exit => return,
            NextStep::Wait => {}
        }
    }
}

async fn run_job(shared: &Shared, job: Job) {
    shared.state.lock().active += 1;

    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!(pool = %shared.name, "Task panicked in pool worker");
    }

    let mut state = shared.state.lock();
    state.active -= 1;
    state.completed += 1;
}

/// Pick up queued work, or register as idle.
fn take_next(shared: &Shared) -> NextStep {
    let mut state = shared.state.lock();
    if let Some(job) = state.queue.pop_front() {
        return NextStep::Run(job);
    }
    if state.shutdown {
        retire(shared, &mut state);
        return NextStep::Exit;
    }
    state.idle += 1;
    NextStep::Wait
}

fn after_wait(shared: &Shared, timed_out: bool) -> NextStep {
    let mut state = shared.state.lock();
    state.idle -= 1;
    if let Some(job) = state.queue.pop_front() {
        return NextStep::Run(job);
    }
    if state.shutdown || (timed_out && state.workers > shared.core_size) {
        retire(shared, &mut state);
        return NextStep::Exit;
    }
    NextStep::Wait
}

fn retire(shared: &Shared, state: &mut PoolState) {
    state.workers -= 1;
    if state.shutdown && state.workers == 0 {
        debug!(pool = %shared.name, "Thread pool terminated");
        shared.terminated.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_runs_submitted_tasks() {
        let pool = ThreadPool::new("test", 2, 4, 10);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let c = counter.clone();
        pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .unwrap();

        rx.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pool_size(), 1);
    }

    #[tokio::test]
    async fn test_worker_name_visible_to_task() {
        let pool = ThreadPool::new("named", 1, 1, 1);
        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(current_worker());
        })
        .unwrap();

        let name = rx.await.unwrap().unwrap();
        assert!(name.starts_with("named-worker-"));
        assert!(current_worker().is_none());
    }

    #[tokio::test]
    async fn test_rejects_when_saturated() {
        let pool = ThreadPool::new("tiny", 1, 1, 0);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = release_rx.await;
        })
        .unwrap();

        let err = pool.submit(async {}).unwrap_err();
        match err {
            RpcError::Rejected { pool: name, stats } => {
                assert_eq!(name, "tiny");
                assert_eq!(stats.pool_size, 1);
                assert_eq!(stats.queue_remaining, 0);
            }
            other => panic!("unexpected error: {other}"),
        }

        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn test_queue_then_grow_to_max() {
        let pool = ThreadPool::new("grow", 1, 2, 1);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        for _ in 0..3 {
            let mut rx = release_rx.clone();
            pool.submit(async move {
                let _ = rx.wait_for(|released| *released).await;
            })
            .unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.largest_pool_size, 2);
        assert_eq!(stats.task_count, 3);
        assert!(pool.submit(async {}).is_err());

        let _ = release_tx.send(true);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)).await);
        assert_eq!(pool.stats().completed_task_count, 3);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_pool() {
        let pool = ThreadPool::new("panicky", 1, 1, 4);
        pool.submit(async { panic!("boom") }).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .unwrap();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_work() {
        let pool = ThreadPool::new("drain", 1, 1, 10);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = counter.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert!(matches!(pool.submit(async {}), Err(RpcError::PoolShutdown(_))));
        assert!(pool.await_termination(Duration::from_secs(2)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(pool.is_terminated());
    }

    #[tokio::test]
    async fn test_idle_pool_terminates_immediately() {
        let pool = ThreadPool::new("idle", 2, 2, 2);
        assert!(pool.shutdown_gracefully().await);
    }

    #[tokio::test]
    async fn test_extra_workers_retire_after_keep_alive() {
        let pool = ThreadPool::with_keep_alive("retire", 0, 2, 0, Duration::from_millis(20));
        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .unwrap();
        rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.pool_size(), 0);
    }
}
