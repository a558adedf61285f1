//! # Realtime Broadcaster
//!
//! Keeps the live set of dashboard subscribers and fans every processed sample
//! out to them as an ordered message sequence.
//!
//! ## Core Design Principles:
//!
//! 1.  **Shared Frames**: each outbound message is built once and wrapped in an
//!     `Arc`; subscribers receive pointer clones, never copies.
//! 2.  **Per-Subscriber Ordering**: a subscriber's full turn (geometry, spectral,
//!     analysis result, then that sample's alerts) is enqueued before the loop
//!     moves to the next subscriber. No global lock is held during the sends.
//! 3.  **Failure Isolation**: each subscriber owns a bounded queue. A closed
//!     queue, or one that stays full past `send_timeout`, marks the subscriber
//!     failed; the loop carries on and failed subscribers are removed once it
//!     has finished.
//!
//! The broadcaster also remembers the last sample it fanned out, so a
//! dashboard registering right after a broadcast still gets it as bootstrap,
//! and keeps the registry of currently connected devices for the status page.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use super::filter::{SubscriptionFilter, filter_matches};
use super::messages::{DashboardControl, DashboardMessage};
use crate::core::metrics::{self, MetricsSink};
use crate::models::{Alert, FusionSample};

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Outbound queue length per subscriber.
    pub queue_capacity: usize,
    /// How long one enqueue may wait on a full queue before the subscriber is dropped.
    pub send_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_secs(2),
        }
    }
}

/// Room for the bootstrap frames plus one full sample turn.
const MIN_QUEUE_CAPACITY: usize = 8;

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Arc<DashboardMessage>>,
    filter: RwLock<Option<SubscriptionFilter>>,
    connected_at: DateTime<Utc>,
}

impl Subscriber {
    fn wants(&self, sample: &FusionSample) -> bool {
        let filter = self.filter.read().unwrap_or_else(PoisonError::into_inner);
        filter_matches(filter.as_ref(), sample)
    }
}

/// The receiving end handed to a dashboard connection.
pub struct SubscriberHandle {
    id: u64,
    receiver: mpsc::Receiver<Arc<DashboardMessage>>,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next queued frame. `None` once the broadcaster has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<DashboardMessage>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<DashboardMessage>> {
        self.receiver.try_recv().ok()
    }
}

/// Per-call fan-out statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers whose filter matched and whose full turn was enqueued.
    pub delivered: usize,
    /// Subscribers skipped by their filter.
    pub filtered: usize,
    /// Subscribers removed because a send failed.
    pub removed: usize,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    connections: usize,
    connected_at: DateTime<Utc>,
}

/// # Realtime Broadcaster
pub struct RealtimeBroadcaster {
    config: BroadcasterConfig,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    /// Last sample whose fan-out snapshot was taken. Locked after `subscribers`.
    last_broadcast: Mutex<Option<Arc<FusionSample>>>,
    devices: Mutex<HashMap<String, DeviceEntry>>,
    next_id: AtomicU64,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RealtimeBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(Vec::new()),
            last_broadcast: Mutex::new(None),
            devices: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_broadcast(&self) -> MutexGuard<'_, Option<Arc<FusionSample>>> {
        self.last_broadcast.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, DeviceEntry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Add Subscriber
    ///
    /// Registers a dashboard connection and returns its queue. `stored` is
    /// the latest sample read from the store, if any.
    ///
    /// ## Logic:
    /// 1.  Creates the subscriber's bounded queue.
    /// 2.  Under the subscriber lock, picks the bootstrap sample: the newer of
    ///     `stored` and the last sample already fanned out. A broadcast that
    ///     snapshotted before this point is covered by the bootstrap; any
    ///     later one sees the new subscriber.
    /// 3.  Enqueues `connection_established`, then `latest_sample`, while
    ///     nobody else can see the queue yet.
    /// 4.  Publishes the subscriber, so live samples always follow the bootstrap.
    pub fn add_subscriber(&self, stored: Option<&FusionSample>) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(MIN_QUEUE_CAPACITY));
        let now = Utc::now();

        let count = {
            let mut subs = self.subscribers();
            let broadcast = self.last_broadcast().clone();
            let bootstrap = match (stored, broadcast.as_deref()) {
                (Some(s), Some(b)) if s.timestamp > b.timestamp => Some(s),
                (_, Some(b)) => Some(b),
                (s, None) => s,
            };

            // The queue is fresh and larger than two, so neither enqueue can fail.
            let _ = sender.try_send(Arc::new(DashboardMessage::ConnectionEstablished {
                timestamp: now,
                subscriber_id: id,
                message: "Connected to realtime dashboard feed".to_string(),
            }));
            if let Some(sample) = bootstrap {
                let _ = sender.try_send(Arc::new(DashboardMessage::LatestSample {
                    timestamp: now,
                    data: sample.clone(),
                }));
            }

            subs.push(Arc::new(Subscriber {
                id,
                sender,
                filter: RwLock::new(None),
                connected_at: now,
            }));
            subs.len()
        };
        tracing::info!(subscriber = id, subscribers = count, "dashboard subscriber added");
        self.publish_count(count);
        SubscriberHandle { id, receiver }
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn remove_subscriber(&self, id: u64) -> bool {
        let (removed, count) = {
            let mut subs = self.subscribers();
            let removed = subs.iter().position(|s| s.id == id).map(|i| subs.remove(i));
            (removed, subs.len())
        };
        let Some(sub) = removed else { return false };
        let connected_secs = (Utc::now() - sub.connected_at).num_seconds();
        tracing::info!(subscriber = id, subscribers = count, connected_secs, "dashboard subscriber removed");
        self.publish_count(count);
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn filter(&self, id: u64) -> Option<SubscriptionFilter> {
        let subs = self.subscribers();
        let sub = subs.iter().find(|s| s.id == id)?;
        let filter = sub.filter.read().unwrap_or_else(PoisonError::into_inner);
        filter.clone()
    }

    /// Atomically replaces subscriber `id`'s filter. `None` clears it.
    pub fn set_filter(&self, id: u64, filter: Option<SubscriptionFilter>) -> bool {
        let Some(sub) = self.subscribers().iter().find(|s| s.id == id).cloned() else {
            return false;
        };
        *sub.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
        true
    }

    /// # Handle Control
    ///
    /// Applies one control frame from subscriber `id` and returns the reply.
    /// Malformed or unknown frames get an `error` reply; nothing is torn down.
    pub fn handle_control(&self, id: u64, text: &str) -> DashboardMessage {
        let control = match serde_json::from_str::<DashboardControl>(text) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(subscriber = id, error = %e, "bad dashboard control message");
                return DashboardMessage::error("protocol_error", format!("invalid control message: {}", e));
            }
        };

        let timestamp = Utc::now();
        match control {
            DashboardControl::Heartbeat => DashboardMessage::HeartbeatAck { timestamp },
            DashboardControl::Subscribe { filters } => {
                tracing::debug!(subscriber = id, ?filters, "dashboard filter replaced");
                self.set_filter(id, filters.clone());
                DashboardMessage::SubscribeAck { timestamp, filters }
            }
            DashboardControl::Unsubscribe => {
                self.set_filter(id, None);
                DashboardMessage::UnsubscribeAck { timestamp }
            }
        }
    }

    /// # Broadcast Sample
    ///
    /// Fans `sample` and its `alerts` out to every matching subscriber.
    ///
    /// ## Logic:
    /// 1.  Builds the three sample parts and one frame per alert, once.
    /// 2.  Snapshots the subscriber list and releases the lock.
    /// 3.  For each subscriber whose filter matches, enqueues its full turn in
    ///     order. The first failed enqueue ends that subscriber's turn and marks
    ///     it failed.
    /// 4.  Removes failed subscribers after the loop.
    pub async fn broadcast_sample(&self, sample: &FusionSample, alerts: &[Alert]) -> BroadcastReport {
        let frames: Vec<Arc<DashboardMessage>> = DashboardMessage::sample_parts(sample)
            .into_iter()
            .chain(alerts.iter().map(DashboardMessage::alert))
            .map(Arc::new)
            .collect();

        let snapshot: Vec<Arc<Subscriber>> = {
            let subs = self.subscribers();
            *self.last_broadcast() = Some(Arc::new(sample.clone()));
            subs.clone()
        };
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for sub in &snapshot {
            if !sub.wants(sample) {
                report.filtered += 1;
                continue;
            }
            let mut ok = true;
            for frame in &frames {
                if let Err(e) = sub
                    .sender
                    .send_timeout(Arc::clone(frame), self.config.send_timeout)
                    .await
                {
                    tracing::warn!(subscriber = sub.id, error = %e, "dashboard send failed, dropping subscriber");
                    ok = false;
                    break;
                }
            }
            if ok {
                report.delivered += 1;
            } else {
                failed.push(sub.id);
            }
        }
        drop(snapshot);

        for id in failed {
            if self.remove_subscriber(id) {
                report.removed += 1;
            }
        }
        tracing::debug!(
            sample_id = %sample.sample_id,
            delivered = report.delivered,
            filtered = report.filtered,
            removed = report.removed,
            "sample broadcast"
        );
        report
    }

    /// Records a device connection in the live registry.
    pub fn register_device(&self, device_id: &str) {
        let mut devices = self.devices();
        let entry = devices.entry(device_id.to_string()).or_insert_with(|| DeviceEntry {
            connections: 0,
            connected_at: Utc::now(),
        });
        entry.connections += 1;
    }

    /// Drops one connection of `device_id` from the registry.
    pub fn unregister_device(&self, device_id: &str) {
        let mut devices = self.devices();
        if let Some(entry) = devices.get_mut(device_id) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                devices.remove(device_id);
            }
        }
    }

    /// Connected device ids with the time their oldest live connection was made.
    pub fn connected_devices(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut list: Vec<_> = self
            .devices()
            .iter()
            .map(|(id, e)| (id.clone(), e.connected_at))
            .collect();
        list.sort();
        list
    }

    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.devices().contains_key(device_id)
    }

    fn publish_count(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge(metrics::DASHBOARD_SUBSCRIBERS, count as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertType, Grade, SensorBlock, Severity};
    use serde_json::Map;

    fn broadcaster(capacity: usize) -> RealtimeBroadcaster {
        RealtimeBroadcaster::new(BroadcasterConfig {
            queue_capacity: capacity,
            send_timeout: Duration::from_millis(50),
        })
    }

    fn sample(id: &str, grade: Grade) -> FusionSample {
        FusionSample {
            sample_id: id.into(),
            device_id: "dev-1".into(),
            site_id: None,
            firmware_version: None,
            timestamp: Utc::now(),
            tof_score: None,
            spectral_score: None,
            final_score: 0.5,
            final_grade: grade,
            defects: vec![],
            compliance: true,
            geometry: SensorBlock::default(),
            spectral: SensorBlock::default(),
        }
    }

    fn alert(sample_id: &str) -> Alert {
        Alert {
            alert_id: format!("{}:quality_low", sample_id),
            sample_id: sample_id.into(),
            device_id: "dev-1".into(),
            alert_type: AlertType::QualityLow,
            severity: Severity::Warning,
            message: "low".into(),
            context: Map::new(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }

    fn drain(handle: &mut SubscriberHandle) -> Vec<Arc<DashboardMessage>> {
        std::iter::from_fn(|| handle.try_recv()).collect()
    }

    fn kind(msg: &DashboardMessage) -> String {
        let value = serde_json::to_value(msg).unwrap();
        match value.get("sensor_type").and_then(|v| v.as_str()) {
            Some(sensor) => format!("sensor_data:{}", sensor),
            None => value["type"].as_str().unwrap().to_string(),
        }
    }

    #[tokio::test]
    async fn bootstrap_precedes_live_samples() {
        let b = broadcaster(16);
        let latest = sample("old", Grade::A);
        let mut h = b.add_subscriber(Some(&latest));
        b.broadcast_sample(&sample("new", Grade::A), &[]).await;

        let kinds: Vec<String> = drain(&mut h).iter().map(|m| kind(m)).collect();
        assert_eq!(
            kinds,
            vec![
                "connection_established",
                "latest_sample",
                "sensor_data:geometry",
                "sensor_data:spectral",
                "analysis_result"
            ]
        );
    }

    #[tokio::test]
    async fn late_subscriber_is_bootstrapped_from_last_broadcast() {
        let b = broadcaster(16);
        let mut stored = sample("stored", Grade::A);
        stored.timestamp = Utc::now() - chrono::Duration::seconds(5);
        b.broadcast_sample(&sample("sent", Grade::B), &[]).await;

        // The store read raced the broadcast and came back stale.
        let mut h = b.add_subscriber(Some(&stored));
        let frames = drain(&mut h);
        assert_eq!(frames.len(), 2);
        match &*frames[1] {
            DashboardMessage::LatestSample { data, .. } => assert_eq!(data.sample_id, "sent"),
            other => panic!("unexpected bootstrap frame: {}", kind(other)),
        }

        // A stored sample newer than anything broadcast wins.
        let mut fresh = sample("fresh", Grade::A);
        fresh.timestamp = Utc::now() + chrono::Duration::seconds(5);
        let mut h = b.add_subscriber(Some(&fresh));
        match &*drain(&mut h)[1] {
            DashboardMessage::LatestSample { data, .. } => assert_eq!(data.sample_id, "fresh"),
            other => panic!("unexpected bootstrap frame: {}", kind(other)),
        }
    }

    #[tokio::test]
    async fn alerts_follow_the_three_parts() {
        let b = broadcaster(16);
        let mut h = b.add_subscriber(None);
        drain(&mut h);
        let s = sample("s-1", Grade::C);
        let report = b.broadcast_sample(&s, &[alert("s-1")]).await;
        assert_eq!(report.delivered, 1);

        let kinds: Vec<String> = drain(&mut h).iter().map(|m| kind(m)).collect();
        assert_eq!(
            kinds,
            vec!["sensor_data:geometry", "sensor_data:spectral", "analysis_result", "alert"]
        );
    }

    #[tokio::test]
    async fn filtered_subscriber_sees_nothing_below_min_grade() {
        let b = broadcaster(16);
        let mut picky = b.add_subscriber(None);
        let mut open = b.add_subscriber(None);
        let reply = b.handle_control(picky.id(), r#"{"type":"subscribe","filters":{"min_grade":"A"}}"#);
        assert!(matches!(reply, DashboardMessage::SubscribeAck { filters: Some(_), .. }));
        drain(&mut picky);
        drain(&mut open);

        for g in [Grade::B, Grade::C, Grade::Reject] {
            b.broadcast_sample(&sample("low", g), &[alert("low")]).await;
        }
        assert!(drain(&mut picky).is_empty());
        assert_eq!(drain(&mut open).len(), 12);

        b.broadcast_sample(&sample("top", Grade::APlus), &[]).await;
        assert_eq!(drain(&mut picky).len(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_clears_filter() {
        let b = broadcaster(16);
        let h = b.add_subscriber(None);
        b.handle_control(h.id(), r#"{"type":"subscribe","filters":{"device_id":"x"}}"#);
        assert!(b.filter(h.id()).is_some());
        let reply = b.handle_control(h.id(), r#"{"type":"unsubscribe"}"#);
        assert!(matches!(reply, DashboardMessage::UnsubscribeAck { .. }));
        assert!(b.filter(h.id()).is_none());
    }

    #[tokio::test]
    async fn bad_control_gets_error_reply() {
        let b = broadcaster(16);
        let h = b.add_subscriber(None);
        assert!(matches!(b.handle_control(h.id(), "not json"), DashboardMessage::Error { .. }));
        assert!(matches!(
            b.handle_control(h.id(), r#"{"type":"heartbeat"}"#),
            DashboardMessage::HeartbeatAck { .. }
        ));
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed_and_others_still_served() {
        let b = broadcaster(16);
        let gone = b.add_subscriber(None);
        let mut alive = b.add_subscriber(None);
        drain(&mut alive);
        drop(gone);

        let report = b.broadcast_sample(&sample("s", Grade::A), &[]).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(drain(&mut alive).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_is_dropped_after_send_timeout() {
        let b = broadcaster(MIN_QUEUE_CAPACITY);
        let _stuck = b.add_subscriber(None);
        let mut fast = b.add_subscriber(None);

        // Fill the stuck queue; the fast one keeps draining.
        let mut removed = 0;
        for i in 0..4 {
            drain(&mut fast);
            removed += b.broadcast_sample(&sample(&format!("s{}", i), Grade::A), &[]).await.removed;
        }
        assert_eq!(removed, 1);
        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(drain(&mut fast).len(), 3);
    }

    #[test]
    fn device_registry_counts_connections() {
        let b = broadcaster(16);
        b.register_device("d1");
        b.register_device("d1");
        b.unregister_device("d1");
        assert!(b.is_device_connected("d1"));
        b.unregister_device("d1");
        assert!(!b.is_device_connected("d1"));
        b.unregister_device("never");
        assert!(b.connected_devices().is_empty());
    }
}
