//! # Observability Sink
//!
//! Fire-and-forget counters and gauges. Implementations must never block the
//! caller: the ingestion path reports through this trait on every sample.

use crate::core::circuit_breaker::CircuitState;

/// Counter bumped once per acknowledged sample.
pub const SAMPLES_PROCESSED: &str = "samples_processed";
/// Counter bumped once per alert produced by the rule engine.
pub const ALERTS_RAISED: &str = "alerts_raised";
/// Gauge of open device and dashboard websocket connections.
pub const ACTIVE_WEBSOCKETS: &str = "active_websocket_connections";
/// Gauge of in-flight HTTP requests.
pub const ACTIVE_HTTP_REQUESTS: &str = "active_http_requests";
/// Gauge of registered dashboard subscribers.
pub const DASHBOARD_SUBSCRIBERS: &str = "dashboard_subscribers";

/// Receiver for process metrics.
pub trait MetricsSink: Send + Sync {
    /// Adds `by` to a monotonically increasing counter.
    fn incr(&self, counter: &str, by: u64);
    /// Records the current value of a gauge.
    fn gauge(&self, gauge: &str, value: u64);
    /// Records a circuit breaker state transition.
    fn breaker_state(&self, breaker: &str, state: CircuitState);
}

/// Default sink: emits every metric as a `debug` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn incr(&self, counter: &str, by: u64) {
        tracing::debug!(target: "metrics", counter, by, "counter");
    }

    fn gauge(&self, gauge: &str, value: u64) {
        tracing::debug!(target: "metrics", gauge, value, "gauge");
    }

    fn breaker_state(&self, breaker: &str, state: CircuitState) {
        tracing::info!(target: "metrics", breaker, state = state.as_str(), "breaker state");
    }
}
