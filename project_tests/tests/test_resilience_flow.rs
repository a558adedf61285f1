use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use lib_fusion::core::{CheckStatus, CircuitBreakerConfig, CircuitState, RateLimiterConfig};
use lib_fusion::models::{Alert, FusionSample};
use lib_fusion::{IngestionServices, MemoryStore, SampleStore, ServicesConfig, StoreError};
use project_tests::{Peer, connected_device, sensor_frame};

/// Memory store with an outage switch.
#[derive(Default)]
struct SwitchableStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl SwitchableStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SampleStore for SwitchableStore {
    async fn save_sample(&self, sample: &FusionSample) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_sample(sample).await
    }
    async fn get_latest_sample(&self) -> Result<Option<FusionSample>, StoreError> {
        self.check()?;
        self.inner.get_latest_sample().await
    }
    async fn create_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.check()?;
        self.inner.create_alert(alert).await
    }
}

fn setup(config: ServicesConfig) -> (Arc<SwitchableStore>, Arc<IngestionServices>) {
    let store = Arc::new(SwitchableStore::default());
    let services = IngestionServices::new(store.clone(), config);
    (store, services)
}

#[tokio::test]
async fn store_outage_trips_breaker_then_recovers() {
    let (store, services) = setup(ServicesConfig {
        breaker: CircuitBreakerConfig {
            name: "sample_store".into(),
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_millis(150),
        },
        ..Default::default()
    });
    let mut device = connected_device(&services, "dev-1").await;

    store.down.store(true, Ordering::SeqCst);
    for id in ["a", "b", "c"] {
        let reply = device.recv_after(sensor_frame("dev-1", id, 0.9, "A")).await;
        assert_eq!(reply["error"], "storage_unavailable");
    }
    assert_eq!(services.store_breaker.state(), CircuitState::Open);
    assert_eq!(services.readiness().await.status, CheckStatus::Degraded);

    // Dashboards still connect, just without a bootstrap frame.
    let mut dashboard = Peer::dashboard(&services);
    assert_eq!(dashboard.recv().await["type"], "connection_established");

    store.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ack = device.recv_after(sensor_frame("dev-1", "d", 0.9, "A")).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(services.store_breaker.state(), CircuitState::Closed);
    assert_eq!(dashboard.recv().await["sample_id"], "d");
    assert_eq!(store.inner.samples().len(), 1);
    assert_eq!(services.readiness().await.status, CheckStatus::Ok);

    device.close().await;
    dashboard.close().await;
}

#[tokio::test]
async fn devices_are_limited_independently() {
    let (store, services) = setup(ServicesConfig {
        rate_limit: RateLimiterConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            adaptive: None,
        },
        ..Default::default()
    });
    let mut noisy = connected_device(&services, "noisy").await;
    let mut quiet = connected_device(&services, "quiet").await;

    for id in ["n1", "n2"] {
        assert_eq!(noisy.recv_after(sensor_frame("noisy", id, 0.9, "A")).await["type"], "ack");
    }
    let limited = noisy.recv_after(sensor_frame("noisy", "n3", 0.9, "A")).await;
    assert_eq!(limited["error"], "rate_limit_exceeded");
    assert!(limited["data"]["retry_after_ms"].as_u64().unwrap() > 0);

    assert_eq!(quiet.recv_after(sensor_frame("quiet", "q1", 0.9, "A")).await["type"], "ack");
    assert_eq!(store.inner.samples().len(), 3);

    // Limited, not disconnected.
    let again = noisy.recv_after(serde_json::json!({ "type": "heartbeat" })).await;
    assert_eq!(again["error"], "rate_limit_exceeded");
    assert!(services.broadcaster.is_device_connected("noisy"));

    noisy.close().await;
    quiet.close().await;
}
