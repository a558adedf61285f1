//! # Shutdown Coordinator
//!
//! Tracks in-flight HTTP requests and websocket connections and drives an
//! orderly, bounded termination of the gateway.
//!
//! ## Shutdown Sequence:
//!
//! 1.  **Hooks**: registered shutdown hooks run in registration order. A failing
//!     hook is logged and the sequence continues. The shared cancellation token
//!     is cancelled once the hooks are done, telling every connection task to
//!     wind down.
//! 2.  **Drain**: the activity counters are polled every `poll_interval` until
//!     both reach zero or `drain_timeout` elapses; the remaining counts are
//!     logged on each tick. The sequence proceeds either way.
//! 3.  **Cleanup**: registered cleanup tasks run one after another, each under
//!     its own `timeout`, so a stuck task only costs its own budget.
//! 4.  **Complete**: the coordinator is marked complete and waiters are woken.
//!
//! Only the first call to [`ShutdownCoordinator::shutdown`] runs the sequence;
//! any later or concurrent call logs a warning and returns `None`.

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::metrics::{self, MetricsSink};

type Task = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for active work to finish.
    pub drain_timeout: Duration,
    /// How often the activity counters are checked while draining.
    pub poll_interval: Duration,
    /// Default budget for each cleanup task.
    pub cleanup_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

/// The kinds of activity the coordinator waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    HttpRequest,
    WebsocketConnection,
}

/// Result of one cleanup task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// What happened during a shutdown run.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Names of hooks that returned an error.
    pub hook_failures: Vec<String>,
    /// `true` if all activity finished before the drain timeout.
    pub drained: bool,
    pub remaining_http_requests: usize,
    pub remaining_websocket_connections: usize,
    pub cleanups: Vec<(String, CleanupOutcome)>,
    pub elapsed_ms: u64,
}

/// # Shutdown Coordinator
///
/// Shared through an `Arc`; connection handlers take an [`ActivityGuard`] for
/// their lifetime and watch [`ShutdownCoordinator::token`] to know when to stop.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    http_requests: AtomicUsize,
    websocket_connections: AtomicUsize,
    hooks: Mutex<Vec<(String, Task)>>,
    cleanups: Mutex<Vec<(String, Duration, Task)>>,
    started: AtomicBool,
    token: CancellationToken,
    complete_tx: watch::Sender<bool>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self {
            config,
            http_requests: AtomicUsize::new(0),
            websocket_connections: AtomicUsize::new(0),
            hooks: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            token: CancellationToken::new(),
            complete_tx,
            metrics: None,
        }
    }

    /// Publishes the activity counters as gauges on every change.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cancelled when the shutdown sequence finishes its hooks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_tx.borrow()
    }

    /// Resolves once the shutdown sequence has fully completed.
    pub async fn wait_complete(&self) {
        let mut rx = self.complete_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Registers a hook for step 1. Hooks run in registration order.
    pub fn register_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task: Task = Box::new(move || Box::pin(hook()));
        lock(&self.hooks).push((name.into(), task));
    }

    /// Registers a cleanup task for step 3 with the default timeout.
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_cleanup_with_timeout(name, self.config.cleanup_timeout, cleanup);
    }

    /// Registers a cleanup task with its own timeout.
    pub fn register_cleanup_with_timeout<F, Fut>(
        &self,
        name: impl Into<String>,
        timeout: Duration,
        cleanup: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task: Task = Box::new(move || Box::pin(cleanup()));
        lock(&self.cleanups).push((name.into(), timeout, task));
    }

    fn counter(&self, kind: ActivityKind) -> &AtomicUsize {
        match kind {
            ActivityKind::HttpRequest => &self.http_requests,
            ActivityKind::WebsocketConnection => &self.websocket_connections,
        }
    }

    pub fn increment(&self, kind: ActivityKind) -> usize {
        let now = self.counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(kind, now);
        now
    }

    /// Decrements the counter for `kind`, saturating at zero.
    pub fn decrement(&self, kind: ActivityKind) -> usize {
        let prev = self
            .counter(kind)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let now = prev.saturating_sub(1);
        self.publish(kind, now);
        now
    }

    /// Counts one unit of `kind` until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, kind: ActivityKind) -> ActivityGuard {
        self.increment(kind);
        ActivityGuard {
            coordinator: Arc::clone(self),
            kind,
        }
    }

    pub fn active(&self, kind: ActivityKind) -> usize {
        self.counter(kind).load(Ordering::SeqCst)
    }

    fn publish(&self, kind: ActivityKind, value: usize) {
        if let Some(metrics) = &self.metrics {
            let gauge = match kind {
                ActivityKind::HttpRequest => metrics::ACTIVE_HTTP_REQUESTS,
                ActivityKind::WebsocketConnection => metrics::ACTIVE_WEBSOCKETS,
            };
            metrics.gauge(gauge, value as u64);
        }
    }

    /// # Shutdown
    ///
    /// Runs the four-step sequence described in the module docs. Returns the
    /// report of the run, or `None` if another call already started it.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("shutdown already in progress, ignoring duplicate request");
            return None;
        }
        let started_at = Instant::now();
        tracing::info!(
            http_requests = self.active(ActivityKind::HttpRequest),
            websocket_connections = self.active(ActivityKind::WebsocketConnection),
            "shutdown started"
        );

        // --- 1. Hooks ---
        let hooks = std::mem::take(&mut *lock(&self.hooks));
        let mut hook_failures = Vec::new();
        for (name, hook) in hooks {
            match hook().await {
                Ok(()) => tracing::debug!(hook = %name, "shutdown hook finished"),
                Err(e) => {
                    tracing::error!(hook = %name, error = %e, "shutdown hook failed, continuing");
                    hook_failures.push(name);
                }
            }
        }
        self.token.cancel();

        // --- 2. Drain ---
        let drained = self.drain().await;

        // --- 3. Cleanup ---
        let cleanups = std::mem::take(&mut *lock(&self.cleanups));
        let mut outcomes = Vec::with_capacity(cleanups.len());
        for (name, budget, cleanup) in cleanups {
            let outcome = match tokio::time::timeout(budget, cleanup()).await {
                Ok(Ok(())) => CleanupOutcome::Completed,
                Ok(Err(e)) => {
                    tracing::error!(cleanup = %name, error = %e, "cleanup task failed");
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::error!(cleanup = %name, ?budget, "cleanup task timed out");
                    CleanupOutcome::TimedOut
                }
            };
            outcomes.push((name, outcome));
        }

        // --- 4. Complete ---
        let report = ShutdownReport {
            hook_failures,
            drained,
            remaining_http_requests: self.active(ActivityKind::HttpRequest),
            remaining_websocket_connections: self.active(ActivityKind::WebsocketConnection),
            cleanups: outcomes,
            elapsed_ms: started_at.elapsed().as_millis().min(u64::MAX as u128) as u64,
        };
        self.complete_tx.send_replace(true);
        tracing::info!(elapsed_ms = report.elapsed_ms, drained = report.drained, "shutdown complete");
        Some(report)
    }

    async fn drain(&self) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let http = self.active(ActivityKind::HttpRequest);
            let ws = self.active(ActivityKind::WebsocketConnection);
            if http == 0 && ws == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    http_requests = http,
                    websocket_connections = ws,
                    "drain timeout reached, proceeding with active work outstanding"
                );
                return false;
            }
            tracing::info!(
                http_requests = http,
                websocket_connections = ws,
                "waiting for active work to finish"
            );
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps one unit of activity counted; decrements on drop.
pub struct ActivityGuard {
    coordinator: Arc<ShutdownCoordinator>,
    kind: ActivityKind,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.coordinator.decrement(self.kind);
    }
}
