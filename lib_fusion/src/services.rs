//! # Ingestion Services
//!
//! The explicitly constructed service objects shared by every device and
//! dashboard connection. One instance per process in the gateway, one per test
//! elsewhere; nothing in the library is a global.

use serde::Serialize;
use std::sync::Arc;

use crate::alerts::{AlertEngine, AlertThresholds};
use crate::broadcast::{BroadcasterConfig, RealtimeBroadcaster};
use crate::core::health::{self, CheckStatus, HealthReport, run_check};
use crate::core::metrics::{MetricsSink, TracingMetricsSink};
use crate::core::{
    ActivityKind, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, RateLimiter,
    RateLimiterConfig, ShutdownConfig, ShutdownCoordinator,
};
use crate::store::SampleStore;

/// Tuning for every service, with the production defaults.
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub broadcaster: BroadcasterConfig,
    pub shutdown: ShutdownConfig,
    pub thresholds: AlertThresholds,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                name: "sample_store".to_string(),
                ..Default::default()
            },
            rate_limit: RateLimiterConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            shutdown: ShutdownConfig::default(),
            thresholds: AlertThresholds::default(),
        }
    }
}

pub struct IngestionServices {
    pub store: Arc<dyn SampleStore>,
    /// Gates every call to `store`.
    pub store_breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub broadcaster: Arc<RealtimeBroadcaster>,
    pub alert_engine: AlertEngine,
    pub metrics: Arc<dyn MetricsSink>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub store_breaker: CircuitSnapshot,
    pub dashboard_subscribers: usize,
    pub connected_devices: Vec<String>,
    pub active_http_requests: usize,
    pub active_websocket_connections: usize,
    pub rate_limited_clients: usize,
    pub system_load: f64,
    pub shutting_down: bool,
}

impl IngestionServices {
    /// Builds the services around `store`, reporting metrics as tracing events.
    pub fn new(store: Arc<dyn SampleStore>, config: ServicesConfig) -> Arc<Self> {
        Self::with_metrics(store, Arc::new(TracingMetricsSink), config)
    }

    pub fn with_metrics(
        store: Arc<dyn SampleStore>,
        metrics: Arc<dyn MetricsSink>,
        config: ServicesConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            store_breaker: Arc::new(
                CircuitBreaker::new(config.breaker).with_metrics(Arc::clone(&metrics)),
            ),
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            broadcaster: Arc::new(
                RealtimeBroadcaster::new(config.broadcaster).with_metrics(Arc::clone(&metrics)),
            ),
            alert_engine: AlertEngine::new(config.thresholds),
            shutdown: Arc::new(
                ShutdownCoordinator::new(config.shutdown).with_metrics(Arc::clone(&metrics)),
            ),
            metrics,
        })
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            store_breaker: self.store_breaker.snapshot(),
            dashboard_subscribers: self.broadcaster.subscriber_count(),
            connected_devices: self
                .broadcaster
                .connected_devices()
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            active_http_requests: self.shutdown.active(ActivityKind::HttpRequest),
            active_websocket_connections: self.shutdown.active(ActivityKind::WebsocketConnection),
            rate_limited_clients: self.limiter.tracked_clients(),
            system_load: self.limiter.current_load(),
            shutting_down: self.shutdown.is_shutting_down(),
        }
    }

    /// Liveness: the runtime still schedules tasks within the short budget.
    pub async fn liveness(&self) -> HealthReport {
        let check = run_check("runtime", health::LIVENESS_BUDGET, async {
            tokio::task::yield_now().await;
            Ok::<(), String>(())
        })
        .await;
        HealthReport::new(vec![check])
    }

    /// # Readiness
    ///
    /// ## Logic:
    /// 1.  Pings the store through its breaker under the readiness budget; an
    ///     open circuit or failed ping is `degraded`.
    /// 2.  A shutdown in progress is `degraded` too, so load balancers stop
    ///     routing new connections here.
    pub async fn readiness(&self) -> HealthReport {
        let store = Arc::clone(&self.store);
        let breaker = Arc::clone(&self.store_breaker);
        let store_check = run_check("store", health::READINESS_BUDGET, async move {
            breaker.call(|| async move { store.ping().await }).await
        })
        .await;

        let shutdown_check = if self.shutdown.is_shutting_down() {
            health::CheckResult {
                name: "shutdown".to_string(),
                status: CheckStatus::Degraded,
                detail: Some("shutdown in progress".to_string()),
                elapsed_ms: 0,
            }
        } else {
            health::CheckResult {
                name: "shutdown".to_string(),
                status: CheckStatus::Ok,
                detail: None,
                elapsed_ms: 0,
            }
        };

        HealthReport::new(vec![store_check, shutdown_check])
    }
}
