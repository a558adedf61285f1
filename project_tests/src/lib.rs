//! Shared harness for the end-to-end tests: in-process stand-ins for device and
//! dashboard websockets, driven through the library's session runners.

use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use lib_fusion::{IngestionServices, run_dashboard_session, run_device_session};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One simulated websocket peer.
pub struct Peer {
    tx: Option<UnboundedSender<String>>,
    rx: UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl Peer {
    pub fn device(services: &Arc<IngestionServices>) -> Self {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let task = tokio::spawn(run_device_session(Arc::clone(services), in_rx, out_tx));
        Self { tx: Some(in_tx), rx: out_rx, task }
    }

    pub fn dashboard(services: &Arc<IngestionServices>) -> Self {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let task = tokio::spawn(run_dashboard_session(Arc::clone(services), in_rx, out_tx));
        Self { tx: Some(in_tx), rx: out_rx, task }
    }

    pub fn send(&self, frame: Value) {
        if let Some(tx) = &self.tx {
            tx.unbounded_send(frame.to_string()).expect("session stopped reading");
        }
    }

    /// Sends `frame` and returns the next reply.
    pub async fn recv_after(&mut self, frame: Value) -> Value {
        self.send(frame);
        self.recv().await
    }

    /// Next frame from the server, parsed. Panics after a short timeout.
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("session closed the connection");
        serde_json::from_str(&text).expect("server sent invalid JSON")
    }

    /// `None` once the server side has closed the connection.
    pub async fn recv_or_closed(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for a frame or close")?;
        Some(serde_json::from_str(&text).expect("server sent invalid JSON"))
    }

    /// Hangs up and waits for the session task to finish.
    pub async fn close(mut self) {
        self.tx.take();
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");
    }

    /// Waits for the server to end the session on its own.
    pub async fn finished(self) {
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");
    }
}

pub fn hello(device_id: &str) -> Value {
    json!({ "type": "hello", "device_id": device_id, "firmware_version": "2.1.0" })
}

pub fn sensor_frame(device_id: &str, sample_id: &str, score: f64, grade: &str) -> Value {
    json!({
        "type": "sensor_data",
        "sample_id": sample_id,
        "device_id": device_id,
        "site_id": "plant-1",
        "timestamp": "2026-05-01T08:30:00Z",
        "geometry_block": { "raw": { "distances_mm": [41.2, 40.8] }, "analysis": { "tof_score": 0.7 } },
        "spectral_block": { "raw": { "bands": [0.1, 0.4] }, "analysis": { "oxidation_index": 0.1, "freshness_index": 0.9 } },
        "fusion_block": { "final_score": score, "final_grade": grade, "defects": [], "compliance": true }
    })
}

/// Connects a device and completes the handshake.
pub async fn connected_device(services: &Arc<IngestionServices>, device_id: &str) -> Peer {
    let mut device = Peer::device(services);
    assert_eq!(device.recv().await["type"], "connection_established");
    device.send(hello(device_id));
    let ack = device.recv().await;
    assert_eq!(ack["type"], "hello_ack", "unexpected handshake reply: {}", ack);
    device
}
