use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Wire name of the severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// The rule that produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    QualityCritical,
    QualityLow,
    GradeReject,
    OxidationHigh,
    FreshnessLow,
}

impl AlertType {
    /// Wire name of the alert type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::QualityCritical => "quality_critical",
            AlertType::QualityLow => "quality_low",
            AlertType::GradeReject => "grade_reject",
            AlertType::OxidationHigh => "oxidation_high",
            AlertType::FreshnessLow => "freshness_low",
        }
    }
}

/// An alert raised against one persisted [`FusionSample`](super::FusionSample).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub sample_id: String,
    pub device_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Marks the alert acknowledged.
    ///
    /// Returns `false` and leaves the record untouched if it was already
    /// acknowledged; the first acknowledger wins.
    pub fn acknowledge(&mut self, by: &str, at: DateTime<Utc>) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_by = Some(by.to_string());
        self.acknowledged_at = Some(at);
        true
    }
}
