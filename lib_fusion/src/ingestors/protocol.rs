//! Device wire protocol: JSON text frames tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::models::{Grade, SensorBlock};

/// Everything a device message can do wrong. Each variant has a stable wire code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    /// Out-of-sequence or unrecognisable frame.
    #[error("{0}")]
    Protocol(String),
    /// Recognised frame with a bad payload.
    #[error("invalid {message_type} message: {reason}")]
    Validation { message_type: String, reason: String },
    #[error("rate limit exceeded, retry in {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    /// Circuit open or the write itself failed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl IngestError {
    pub fn validation(message_type: &str, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            message_type: message_type.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Protocol(_) => "protocol_error",
            IngestError::Validation { .. } => "validation_error",
            IngestError::RateLimited { .. } => "rate_limit_exceeded",
            IngestError::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    /// The `error` frame sent back to the device.
    pub fn reply(&self) -> DeviceOutbound {
        let mut data = json!({ "message": self.to_string() });
        match self {
            IngestError::Validation { message_type, .. } => {
                data["type"] = json!(message_type);
            }
            IngestError::RateLimited { retry_after } => {
                data["retry_after_ms"] = json!(retry_after.as_millis() as u64);
            }
            _ => {}
        }
        DeviceOutbound::Error {
            timestamp: Utc::now(),
            error: self.code(),
            data,
        }
    }
}

/// Server to device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceOutbound {
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
        message: String,
    },
    HelloAck {
        timestamp: DateTime<Utc>,
        device_id: String,
        message: String,
    },
    Ack {
        sample_id: String,
        timestamp: DateTime<Utc>,
        status: &'static str,
        fusion_score: f64,
        fusion_grade: Grade,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    Error {
        timestamp: DateTime<Utc>,
        error: &'static str,
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Device clock at connect time; informational only.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FusionBlock {
    pub final_score: f64,
    pub final_grade: Grade,
    pub compliance: bool,
    #[serde(default)]
    pub tof_score: Option<f64>,
    #[serde(default)]
    pub spectral_score: Option<f64>,
    #[serde(default)]
    pub defects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorData {
    #[serde(default)]
    pub sample_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub geometry_block: SensorBlock,
    pub spectral_block: SensorBlock,
    pub fusion_block: FusionBlock,
}

/// Device to server.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceInbound {
    Hello(Hello),
    SensorData(Box<SensorData>),
    Heartbeat,
}

impl DeviceInbound {
    /// # Parse
    ///
    /// ## Logic:
    /// 1.  The frame must be a JSON object with a string `type`, else `Protocol`.
    /// 2.  Unknown types are `Protocol`.
    /// 3.  A known type whose payload does not fit is `Validation`, naming the type.
    pub fn parse(text: &str) -> Result<Self, IngestError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| IngestError::Protocol(format!("frame is not valid JSON: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| IngestError::Protocol("frame has no message type".to_string()))?
            .to_string();

        match kind.as_str() {
            "hello" => serde_json::from_value(value)
                .map(DeviceInbound::Hello)
                .map_err(|e| IngestError::validation(&kind, e.to_string())),
            "sensor_data" => serde_json::from_value::<SensorData>(value)
                .map(|d| DeviceInbound::SensorData(Box::new(d)))
                .map_err(|e| IngestError::validation(&kind, e.to_string())),
            "heartbeat" => Ok(DeviceInbound::Heartbeat),
            other => Err(IngestError::Protocol(format!("unknown message type '{}'", other))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceInbound::Hello(_) => "hello",
            DeviceInbound::SensorData(_) => "sensor_data",
            DeviceInbound::Heartbeat => "heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sensor_data() {
        let msg = DeviceInbound::parse(
            r#"{
                "type": "sensor_data",
                "sample_id": "s-1",
                "timestamp": "2026-03-01T10:00:00Z",
                "geometry_block": { "raw": {"d": [1,2]}, "analysis": {"tof_score": 0.8} },
                "spectral_block": { "analysis": {"oxidation_index": 0.2} },
                "fusion_block": { "final_score": 0.82, "final_grade": "A", "compliance": true }
            }"#,
        )
        .unwrap();
        match msg {
            DeviceInbound::SensorData(d) => {
                assert_eq!(d.sample_id.as_deref(), Some("s-1"));
                assert_eq!(d.fusion_block.final_grade, Grade::A);
                assert_eq!(d.geometry_block.number("tof_score"), Some(0.8));
                assert!(d.device_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_fusion_block_echoes_type() {
        let err = DeviceInbound::parse(
            r#"{"type":"sensor_data","geometry_block":{},"spectral_block":{}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        let reply = serde_json::to_value(err.reply()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "validation_error");
        assert_eq!(reply["data"]["type"], "sensor_data");
    }

    #[test]
    fn unknown_or_untyped_frames_are_protocol_errors() {
        assert_eq!(DeviceInbound::parse("hi").unwrap_err().code(), "protocol_error");
        assert_eq!(DeviceInbound::parse("{}").unwrap_err().code(), "protocol_error");
        assert_eq!(
            DeviceInbound::parse(r#"{"type":"reboot"}"#).unwrap_err().code(),
            "protocol_error"
        );
        assert_eq!(DeviceInbound::parse(r#"{"type":"heartbeat"}"#).unwrap(), DeviceInbound::Heartbeat);
    }

    #[test]
    fn rate_limit_reply_carries_retry_after() {
        let reply = IngestError::RateLimited { retry_after: Duration::from_millis(1500) }.reply();
        let v = serde_json::to_value(reply).unwrap();
        assert_eq!(v["error"], "rate_limit_exceeded");
        assert_eq!(v["data"]["retry_after_ms"], 1500);
    }
}
