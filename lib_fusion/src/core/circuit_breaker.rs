//! # Circuit Breaker
//!
//! Gates calls to a fragile dependency (the sample store, a cache) and fails
//! fast while that dependency is unhealthy.
//!
//! ## State Machine:
//!
//! - **`Closed`**: calls pass through. Any success resets `failure_count` to 0;
//!   reaching `failure_threshold` counted failures opens the circuit.
//! - **`Open`**: calls are rejected with [`BreakerError::Open`] without invoking
//!   the wrapped operation. The first attempt after `timeout` has elapsed moves
//!   the circuit to `HalfOpen` and is executed.
//! - **`HalfOpen`**: calls pass through on probation. `success_threshold`
//!   successes close the circuit; any counted failure reopens it.
//!
//! ## Failure Classification:
//!
//! Only errors classified as [`FailureClass::Counted`] feed the state machine.
//! [`FailureClass::Passthrough`] errors are returned to the caller and leave the
//! counters and state untouched. The classification is made at the call site,
//! either through the error's [`ClassifyFailure`] impl or an explicit closure
//! passed to [`CircuitBreaker::call_with`].
//!
//! All bookkeeping happens inside short synchronous critical sections; the lock
//! is never held across the wrapped operation's `.await`.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::metrics::MetricsSink;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Healthy: calls pass through.
    Closed,
    /// Unhealthy: calls are rejected immediately.
    Open,
    /// Probation: calls pass through while recovery is being tested.
    HalfOpen,
}

impl CircuitState {
    /// Stable upper-case name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Whether an error counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The dependency misbehaved; feeds the state machine.
    Counted,
    /// Not the dependency's fault; returned untouched.
    Passthrough,
}

/// Default classification for an error type wrapped by the breaker.
pub trait ClassifyFailure {
    /// Classifies this error for breaker bookkeeping.
    fn failure_class(&self) -> FailureClass;
}

/// Tuning for one breaker instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name used in logs, errors and metrics.
    pub name: String,
    /// Counted failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in `HalfOpen` before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by a gated call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit '{name}' is open, retry in {}ms", retry_after.as_millis())]
    Open {
        /// Name of the breaker that rejected the call.
        name: String,
        /// Time left until a probe will be allowed.
        retry_after: Duration,
    },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> BreakerError<E> {
    /// `true` when the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Point-in-time view of a breaker, for probes and status pages.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// How long the circuit has been open, if it is.
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// # Circuit Breaker
///
/// Shared by every task that talks to the guarded dependency; wrap it in an
/// `Arc` and hand clones to the sessions.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            metrics: None,
        }
    }

    /// Reports every state transition to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Critical sections never panic half-way, so the state is consistent even if poisoned.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, without attempting the `Open` → `HalfOpen` transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            open_for_ms: inner
                .opened_at
                .map(|at| at.elapsed().as_millis().min(u64::MAX as u128) as u64),
        }
    }

    /// # Call
    ///
    /// Runs `op` through the breaker, classifying failures with the error
    /// type's [`ClassifyFailure`] impl.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure,
    {
        self.call_with(E::failure_class, op).await
    }

    /// # Call With Classifier
    ///
    /// Runs `op` through the breaker using `classify` to decide whether a
    /// failure counts.
    ///
    /// ## Logic:
    /// 1.  **Admission**: rejected immediately while `Open` and the timeout has
    ///     not elapsed. Once it has, the circuit moves to `HalfOpen` and this call
    ///     goes ahead as the probe.
    /// 2.  **Execution**: `op` runs with no lock held.
    /// 3.  **Bookkeeping**: success and counted failures update the state
    ///     machine; passthrough failures are returned untouched.
    pub async fn call_with<F, Fut, T, E, C>(
        &self,
        classify: C,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> FailureClass,
    {
        if let Err(retry_after) = self.admit() {
            tracing::debug!(breaker = %self.config.name, ?retry_after, "call rejected, circuit open");
            return Err(BreakerError::Open {
                name: self.config.name.clone(),
                retry_after,
            });
        }

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if classify(&e) == FailureClass::Counted {
                    self.on_failure();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Forces the circuit closed and clears all counters.
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.state != CircuitState::Closed;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.opened_at = None;
            changed
        };
        if changed {
            tracing::info!(breaker = %self.config.name, "circuit manually reset to CLOSED");
            self.report(CircuitState::Closed);
        }
    }

    fn admit(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(self.config.timeout);
        if elapsed < self.config.timeout {
            return Err(self.config.timeout - elapsed);
        }
        inner.state = CircuitState::HalfOpen;
        inner.success_count = 0;
        drop(inner);

        tracing::info!(breaker = %self.config.name, "circuit OPEN -> HALF_OPEN, probing");
        self.report(CircuitState::HalfOpen);
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    drop(inner);

                    tracing::info!(breaker = %self.config.name, "circuit HALF_OPEN -> CLOSED");
                    self.report(CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late; ignore it.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    let failures = inner.failure_count;
                    drop(inner);

                    tracing::warn!(breaker = %self.config.name, failures, "circuit CLOSED -> OPEN");
                    self.report(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
                drop(inner);

                tracing::warn!(breaker = %self.config.name, "probe failed, circuit HALF_OPEN -> OPEN");
                self.report(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn report(&self, state: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.breaker_state(&self.config.name, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down,
        BadInput,
    }

    impl ClassifyFailure for TestError {
        fn failure_class(&self) -> FailureClass {
            match self {
                TestError::Down => FailureClass::Counted,
                TestError::BadInput => FailureClass::Passthrough,
            }
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            name: "store".into(),
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        })
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<TestError>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError::Down)
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<TestError>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TestError>(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&b, &calls).await, Err(BreakerError::Inner(TestError::Down))));
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "wrapped op must not run while open");
        assert!(b.snapshot().open_for_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_timeout_then_closes() {
        let b = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4, "probe runs exactly once");
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b, &calls).await.unwrap();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
        assert!(snap.open_for_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&b, &calls).await.unwrap();
        assert!(matches!(fail(&b, &calls).await, Err(BreakerError::Inner(_))));
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.success_count, 0);

        // The open timer restarted at the probe failure.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(succeed(&b, &calls).await.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn any_success_resets_failures_while_closed() {
        let b = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..10 {
            let _ = fail(&b, &calls).await;
            let _ = fail(&b, &calls).await;
            succeed(&b, &calls).await.unwrap();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn passthrough_errors_leave_state_alone() {
        let b = breaker();
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &calls).await;
        for _ in 0..10 {
            let res = b
                .call(|| async { Err::<(), _>(TestError::BadInput) })
                .await;
            assert!(matches!(res, Err(BreakerError::Inner(TestError::BadInput))));
        }
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn error_messages_and_source() {
        use std::error::Error as _;

        let open: BreakerError<std::io::Error> = BreakerError::Open {
            name: "sample_store".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(open.to_string(), "circuit 'sample_store' is open, retry in 1500ms");
        assert!(open.source().is_none());

        let inner = BreakerError::Inner(std::io::Error::other("connection refused"));
        assert_eq!(inner.to_string(), "connection refused");
        assert_eq!(inner.source().map(|e| e.to_string()).as_deref(), Some("connection refused"));
        assert!(!inner.is_open());
    }

    #[tokio::test]
    async fn call_site_classifier_overrides_default() {
        let b = breaker();
        for _ in 0..3 {
            let _ = b
                .call_with(
                    |_: &TestError| FailureClass::Counted,
                    || async { Err::<(), _>(TestError::BadInput) },
                )
                .await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
