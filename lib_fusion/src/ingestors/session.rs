//! # Device Ingestion Session
//!
//! Per-connection protocol handler for one edge device.
//!
//! ## Lifecycle:
//!
//! - **`AwaitingHello`**: the device has been greeted. Only a `hello` with a
//!   non-empty `device_id` is accepted; anything else is a protocol error and
//!   the connection stays open.
//! - **`Active`**: every frame goes through the pipeline in
//!   [`DeviceIngestionSession::handle_frame`].
//! - **`Closing`**: terminal. Frames are ignored and the device has been
//!   removed from the broadcaster's registry.
//!
//! Frames are handled strictly one at a time, in arrival order.

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;

use super::protocol::{DeviceInbound, DeviceOutbound, Hello, IngestError, SensorData};
use crate::broadcast::session::send_json;
use crate::core::circuit_breaker::BreakerError;
use crate::core::metrics;
use crate::core::rate_limiter::Admission;
use crate::core::shutdown::ActivityKind;
use crate::models::FusionSample;
use crate::services::IngestionServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    Active,
    Closing,
}

pub struct DeviceIngestionSession {
    services: Arc<IngestionServices>,
    state: SessionState,
    device_id: Option<String>,
    firmware_version: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
}

impl DeviceIngestionSession {
    pub fn new(services: Arc<IngestionServices>) -> Self {
        Self {
            services,
            state: SessionState::AwaitingHello,
            device_id: None,
            firmware_version: None,
            last_message_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_at
    }

    /// First frame sent on every new connection.
    pub fn greeting(&self) -> DeviceOutbound {
        DeviceOutbound::ConnectionEstablished {
            timestamp: Utc::now(),
            message: "Connected to fusion ingestion gateway, send hello to begin".to_string(),
        }
    }

    /// # Handle Frame
    ///
    /// Processes one inbound text frame and returns the reply to send, or
    /// `None` once the session is closing.
    ///
    /// ## Logic (while `Active`):
    /// 1.  **Admission**: the rate limiter is consulted first; a rejection
    ///     replies `rate_limit_exceeded`.
    /// 2.  **Validation**: the frame is parsed into a sample.
    /// 3.  **Persist**: the sample is saved through the store breaker. Any
    ///     failure replies `storage_unavailable` and stops here.
    /// 4.  **Alert**: rule output is saved; failures are logged and skipped.
    /// 5.  **Broadcast**: the sample and its alerts go to the dashboards.
    /// 6.  **Acknowledge**: replies `ack`.
    pub async fn handle_frame(&mut self, text: &str) -> Option<DeviceOutbound> {
        self.last_message_at = Some(Utc::now());
        let result = match self.state {
            SessionState::Closing => return None,
            SessionState::AwaitingHello => self.handle_handshake(text),
            SessionState::Active => self.handle_active(text).await,
        };
        Some(result.unwrap_or_else(|e| {
            match &e {
                IngestError::Protocol(reason) => {
                    tracing::warn!(device = self.device_id.as_deref(), reason = %reason, "protocol error");
                }
                other => {
                    tracing::debug!(device = self.device_id.as_deref(), error = %other, "device message rejected");
                }
            }
            e.reply()
        }))
    }

    fn handle_handshake(&mut self, text: &str) -> Result<DeviceOutbound, IngestError> {
        // Nothing but a well-formed hello is expected yet.
        let frame = DeviceInbound::parse(text).map_err(|e| match e {
            IngestError::Validation { message_type, reason } if message_type == "hello" => {
                IngestError::Protocol(format!("malformed hello: {}", reason))
            }
            IngestError::Validation { message_type, .. } => IngestError::Protocol(format!(
                "'{}' received before handshake completed",
                message_type
            )),
            other => other,
        })?;
        match frame {
            DeviceInbound::Hello(hello) => self.accept_hello(hello),
            other => Err(IngestError::Protocol(format!(
                "'{}' received before handshake completed",
                other.type_name()
            ))),
        }
    }

    fn accept_hello(&mut self, hello: Hello) -> Result<DeviceOutbound, IngestError> {
        let device_id = hello
            .device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IngestError::Protocol("hello without a device_id".to_string()))?;

        self.services.broadcaster.register_device(&device_id);
        self.state = SessionState::Active;
        self.firmware_version = hello.firmware_version;
        self.device_id = Some(device_id.clone());
        tracing::info!(
            device = %device_id,
            firmware = self.firmware_version.as_deref(),
            "device handshake complete"
        );

        Ok(DeviceOutbound::HelloAck {
            timestamp: Utc::now(),
            message: format!("Device {} registered", device_id),
            device_id,
        })
    }

    async fn handle_active(&mut self, text: &str) -> Result<DeviceOutbound, IngestError> {
        let device_id = self.device_id.clone().unwrap_or_default();

        // --- 1. Admission ---
        if let Admission::Rejected { retry_after } = self.services.limiter.check(&device_id) {
            return Err(IngestError::RateLimited { retry_after });
        }

        // --- 2. Structural validation ---
        let data = match DeviceInbound::parse(text)? {
            DeviceInbound::Heartbeat => {
                return Ok(DeviceOutbound::HeartbeatAck { timestamp: Utc::now() });
            }
            DeviceInbound::Hello(_) => {
                return Err(IngestError::Protocol("handshake already completed".to_string()));
            }
            DeviceInbound::SensorData(data) => data,
        };
        let sample = self.build_sample(&device_id, *data)?;

        // --- 3. Persist ---
        let store = Arc::clone(&self.services.store);
        let record = sample.clone();
        self.services
            .store_breaker
            .call(|| async move { store.save_sample(&record).await })
            .await
            .map_err(|e| {
                match &e {
                    BreakerError::Open { .. } => {
                        tracing::warn!(device = %device_id, sample_id = %sample.sample_id, "store circuit open, sample refused")
                    }
                    BreakerError::Inner(err) => {
                        tracing::error!(device = %device_id, sample_id = %sample.sample_id, error = %err, "failed to persist sample")
                    }
                }
                IngestError::StorageUnavailable(e.to_string())
            })?;

        // --- 4. Alert ---
        let alerts = self.services.alert_engine.evaluate(&sample);
        for alert in &alerts {
            let store = Arc::clone(&self.services.store);
            let record = alert.clone();
            if let Err(e) = self
                .services
                .store_breaker
                .call(|| async move { store.create_alert(&record).await })
                .await
            {
                tracing::error!(alert_id = %alert.alert_id, error = %e, "failed to persist alert, continuing");
            }
        }
        if !alerts.is_empty() {
            self.services.metrics.incr(metrics::ALERTS_RAISED, alerts.len() as u64);
        }

        // --- 5. Broadcast ---
        self.services.broadcaster.broadcast_sample(&sample, &alerts).await;

        // --- 6. Acknowledge ---
        self.services.metrics.incr(metrics::SAMPLES_PROCESSED, 1);
        tracing::debug!(device = %device_id, sample_id = %sample.sample_id, alerts = alerts.len(), "sample processed");
        Ok(DeviceOutbound::Ack {
            sample_id: sample.sample_id,
            timestamp: Utc::now(),
            status: "saved",
            fusion_score: sample.final_score,
            fusion_grade: sample.final_grade,
        })
    }

    fn build_sample(&self, device_id: &str, data: SensorData) -> Result<FusionSample, IngestError> {
        const TYPE: &str = "sensor_data";

        if let Some(claimed) = data.device_id.as_deref() {
            if claimed != device_id {
                return Err(IngestError::validation(
                    TYPE,
                    format!("device_id '{}' does not match session device '{}'", claimed, device_id),
                ));
            }
        }
        let fusion = data.fusion_block;
        if !fusion.final_score.is_finite() || !(0.0..=1.0).contains(&fusion.final_score) {
            return Err(IngestError::validation(
                TYPE,
                format!("final_score {} is outside [0, 1]", fusion.final_score),
            ));
        }

        let sample_id = data
            .sample_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let geometry = data.geometry_block;
        let spectral = data.spectral_block;
        let tof_score = fusion.tof_score.or_else(|| geometry.number("tof_score"));
        let spectral_score = fusion.spectral_score.or_else(|| spectral.number("spectral_score"));

        Ok(FusionSample {
            sample_id,
            device_id: device_id.to_string(),
            site_id: data.site_id,
            firmware_version: self.firmware_version.clone(),
            timestamp: data.timestamp.unwrap_or_else(Utc::now),
            tof_score,
            spectral_score,
            final_score: fusion.final_score,
            final_grade: fusion.final_grade,
            defects: fusion.defects,
            compliance: fusion.compliance,
            geometry,
            spectral,
        })
    }

    /// Moves to `Closing` and removes the device from the live registry.
    pub fn close(&mut self) {
        if self.state == SessionState::Active {
            if let Some(id) = &self.device_id {
                self.services.broadcaster.unregister_device(id);
                tracing::info!(device = %id, "device disconnected");
            }
        }
        self.state = SessionState::Closing;
    }
}

impl Drop for DeviceIngestionSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// # Device Session Driver
///
/// Runs one device connection: greets it, feeds every frame through a
/// [`DeviceIngestionSession`] and writes the replies, until the device goes
/// away or shutdown begins. The websocket activity slot is held throughout.
pub async fn run_device_session<S, K>(services: Arc<IngestionServices>, mut inbound: S, mut outbound: K)
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
{
    let _slot = services.shutdown.track(ActivityKind::WebsocketConnection);
    let token = services.shutdown.token();
    let mut session = DeviceIngestionSession::new(services);

    if send_json(&mut outbound, &session.greeting()).await {
        loop {
            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(device = session.device_id(), "closing device session for shutdown");
                    break;
                }
                frame = inbound.next() => frame,
            };
            let Some(text) = frame else { break };
            if let Some(reply) = session.handle_frame(&text).await {
                if !send_json(&mut outbound, &reply).await {
                    break;
                }
            }
        }
    }

    session.close();
    let _ = outbound.close().await;
}
