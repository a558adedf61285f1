use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::models::{Alert, AlertType, FusionSample, Grade, Severity};

/// Cut-off values for the built-in rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Scores strictly below this raise `quality_critical`.
    pub critical_score: f64,
    /// Scores strictly below this (and not critical) raise `quality_low`.
    pub low_score: f64,
    /// Oxidation indices strictly above this raise `oxidation_high`.
    pub max_oxidation: f64,
    /// Freshness indices strictly below this raise `freshness_low`.
    pub min_freshness: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical_score: 0.4,
            low_score: 0.6,
            max_oxidation: 0.7,
            min_freshness: 0.5,
        }
    }
}

/// # Alert Engine
///
/// Evaluates every rule against a sample, most severe first. All matching
/// rules fire; the score rules are mutually exclusive with each other but
/// independent of the grade and spectral rules.
#[derive(Debug, Clone, Default)]
pub struct AlertEngine {
    thresholds: AlertThresholds,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    /// Returns the alerts for `sample` in rule order.
    ///
    /// Identical input always yields identical output: ids derive from the
    /// sample id and rule, and `created_at` is the sample timestamp.
    pub fn evaluate(&self, sample: &FusionSample) -> Vec<Alert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        if sample.final_score < t.critical_score {
            alerts.push(build(
                sample,
                AlertType::QualityCritical,
                Severity::Critical,
                format!(
                    "Critical quality score {:.2} (below {:.2})",
                    sample.final_score, t.critical_score
                ),
                json!({ "final_score": sample.final_score, "threshold": t.critical_score }),
            ));
        } else if sample.final_score < t.low_score {
            alerts.push(build(
                sample,
                AlertType::QualityLow,
                Severity::Warning,
                format!(
                    "Low quality score {:.2} (below {:.2})",
                    sample.final_score, t.low_score
                ),
                json!({ "final_score": sample.final_score, "threshold": t.low_score }),
            ));
        }

        if sample.final_grade == Grade::Reject {
            alerts.push(build(
                sample,
                AlertType::GradeReject,
                Severity::Critical,
                "Sample graded REJECT".to_string(),
                json!({ "final_grade": sample.final_grade, "final_score": sample.final_score }),
            ));
        }

        if let Some(oxidation) = sample.oxidation_index() {
            if oxidation > t.max_oxidation {
                alerts.push(build(
                    sample,
                    AlertType::OxidationHigh,
                    Severity::Warning,
                    format!("High oxidation index {:.2}", oxidation),
                    json!({ "oxidation_index": oxidation, "threshold": t.max_oxidation }),
                ));
            }
        }

        if let Some(freshness) = sample.freshness_index() {
            if freshness < t.min_freshness {
                alerts.push(build(
                    sample,
                    AlertType::FreshnessLow,
                    Severity::Warning,
                    format!("Low freshness index {:.2}", freshness),
                    json!({ "freshness_index": freshness, "threshold": t.min_freshness }),
                ));
            }
        }

        alerts
    }
}

fn build(
    sample: &FusionSample,
    alert_type: AlertType,
    severity: Severity,
    message: String,
    context: Value,
) -> Alert {
    let context = match context {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Alert {
        alert_id: format!("{}:{}", sample.sample_id, alert_type.as_str()),
        sample_id: sample.sample_id.clone(),
        device_id: sample.device_id.clone(),
        alert_type,
        severity,
        message,
        context,
        created_at: sample.timestamp,
        acknowledged: false,
        acknowledged_by: None,
        acknowledged_at: None,
    }
}
