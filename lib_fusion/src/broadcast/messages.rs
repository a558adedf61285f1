//! Dashboard wire messages. Every frame is a JSON object tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::filter::SubscriptionFilter;
use crate::models::{Alert, FusionSample, Grade, SensorKind};

/// Server to dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
        subscriber_id: u64,
        message: String,
    },
    /// Bootstrap: the newest stored sample, sent right after connecting.
    LatestSample {
        timestamp: DateTime<Utc>,
        data: FusionSample,
    },
    /// Parts 1 and 2 of a sample broadcast.
    SensorData {
        sensor_type: SensorKind,
        sample_id: String,
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        site_id: Option<String>,
        timestamp: DateTime<Utc>,
        raw: Value,
        analysis: Map<String, Value>,
    },
    /// Part 3 of a sample broadcast.
    AnalysisResult {
        sample_id: String,
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        site_id: Option<String>,
        timestamp: DateTime<Utc>,
        tof_score: Option<f64>,
        spectral_score: Option<f64>,
        final_score: f64,
        final_grade: Grade,
        defects: Vec<String>,
        compliance: bool,
    },
    Alert {
        timestamp: DateTime<Utc>,
        data: Alert,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    SubscribeAck {
        timestamp: DateTime<Utc>,
        filters: Option<SubscriptionFilter>,
    },
    UnsubscribeAck {
        timestamp: DateTime<Utc>,
    },
    Error {
        timestamp: DateTime<Utc>,
        error: String,
        data: Value,
    },
}

impl DashboardMessage {
    /// The three ordered parts broadcast for one sample.
    pub fn sample_parts(sample: &FusionSample) -> [DashboardMessage; 3] {
        let sensor = |kind: SensorKind| {
            let block = sample.block(kind);
            DashboardMessage::SensorData {
                sensor_type: kind,
                sample_id: sample.sample_id.clone(),
                device_id: sample.device_id.clone(),
                site_id: sample.site_id.clone(),
                timestamp: sample.timestamp,
                raw: block.raw.clone(),
                analysis: block.analysis.clone(),
            }
        };
        [
            sensor(SensorKind::Geometry),
            sensor(SensorKind::Spectral),
            DashboardMessage::AnalysisResult {
                sample_id: sample.sample_id.clone(),
                device_id: sample.device_id.clone(),
                site_id: sample.site_id.clone(),
                timestamp: sample.timestamp,
                tof_score: sample.tof_score,
                spectral_score: sample.spectral_score,
                final_score: sample.final_score,
                final_grade: sample.final_grade,
                defects: sample.defects.clone(),
                compliance: sample.compliance,
            },
        ]
    }

    pub fn alert(alert: &Alert) -> Self {
        DashboardMessage::Alert {
            timestamp: Utc::now(),
            data: alert.clone(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        DashboardMessage::Error {
            timestamp: Utc::now(),
            error: code.to_string(),
            data: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Dashboard to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardControl {
    Heartbeat,
    /// Replaces the current filter; absent `filters` means "everything".
    Subscribe {
        #[serde(default)]
        filters: Option<SubscriptionFilter>,
    },
    Unsubscribe,
}
