//! # Core Resilience Module
//!
//! The building blocks every connection handler in the gateway leans on. Each
//! component is synchronous-state-behind-a-short-lock, shared through `Arc`, and
//! safe to call from any number of concurrent tasks.
//!
//! ## Core Components:
//!
//! - **`circuit_breaker`**: Gates calls to the sample store and other fragile
//!   dependencies. Fails fast while a dependency is unhealthy and probes it again
//!   after a cool-down.
//!
//! - **`rate_limiter`**: Sliding-window admission control keyed by device id,
//!   with an optional load-adaptive limit.
//!
//! - **`shutdown`**: Tracks in-flight HTTP requests and websocket connections and
//!   runs the hook / drain / cleanup sequence exactly once on termination.
//!
//! - **`health`**: Time-boxed dependency checks for the liveness and readiness
//!   probes.
//!
//! - **`metrics`**: The fire-and-forget observability sink the other components
//!   report through.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Three-state circuit breaker with pluggable failure classification.
pub mod circuit_breaker;
/// Time-boxed liveness and readiness checks.
pub mod health;
/// Counters and gauges sink.
pub mod metrics;
/// Per-client sliding-window rate limiting.
pub mod rate_limiter;
/// Coordinated, bounded process shutdown.
pub mod shutdown;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
    ClassifyFailure, FailureClass,
};
pub use health::{CheckResult, CheckStatus, HealthReport, run_check};
pub use metrics::{MetricsSink, TracingMetricsSink};
pub use rate_limiter::{Admission, AdaptiveLimit, RateLimiter, RateLimiterConfig};
pub use shutdown::{
    ActivityGuard, ActivityKind, CleanupOutcome, ShutdownConfig, ShutdownCoordinator,
    ShutdownReport,
};
