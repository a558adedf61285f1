use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Quality grade attached to every fusion result.
///
/// Variants are declared worst-first so the derived ordering gives
/// `Reject < C < B < A < APlus`, which is the threshold order dashboards filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    /// Unusable product.
    #[serde(rename = "REJECT")]
    Reject,
    /// Lowest acceptable grade.
    #[serde(rename = "C")]
    C,
    /// Mid grade.
    #[serde(rename = "B")]
    B,
    /// Good.
    #[serde(rename = "A")]
    A,
    /// Top grade.
    #[serde(rename = "A+")]
    APlus,
}

impl Grade {
    /// Wire representation of the grade.
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::Reject => "REJECT",
            Grade::C => "C",
            Grade::B => "B",
            Grade::A => "A",
            Grade::APlus => "A+",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A+" => Ok(Grade::APlus),
            "A" => Ok(Grade::A),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            "REJECT" => Ok(Grade::Reject),
            other => Err(format!("unknown grade '{}'", other)),
        }
    }
}

/// Which sub-sensor a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Time-of-flight distance / geometry sensor.
    Geometry,
    /// Spectral sensor.
    Spectral,
}

/// Raw reading plus the on-device analysis of one sub-sensor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorBlock {
    /// Untouched raw payload as the device sent it.
    #[serde(default)]
    pub raw: Value,
    /// Named analysis outputs (indices, scores, flags).
    #[serde(default)]
    pub analysis: Map<String, Value>,
}

impl SensorBlock {
    /// Reads a numeric analysis field, ignoring non-numeric values.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.analysis.get(key).and_then(Value::as_f64)
    }
}

/// One scored reading combining the geometry and spectral analyses into a grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionSample {
    pub sample_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub tof_score: Option<f64>,
    pub spectral_score: Option<f64>,
    /// Always within `[0, 1]`; the session rejects anything else.
    pub final_score: f64,
    pub final_grade: Grade,
    #[serde(default)]
    pub defects: Vec<String>,
    pub compliance: bool,
    pub geometry: SensorBlock,
    pub spectral: SensorBlock,
}

impl FusionSample {
    /// Spectral oxidation index, if the device reported one.
    pub fn oxidation_index(&self) -> Option<f64> {
        self.spectral.number("oxidation_index")
    }

    /// Spectral freshness index, if the device reported one.
    pub fn freshness_index(&self) -> Option<f64> {
        self.spectral.number("freshness_index")
    }

    /// The sub-sensor block for `kind`.
    pub fn block(&self, kind: SensorKind) -> &SensorBlock {
        match kind {
            SensorKind::Geometry => &self.geometry,
            SensorKind::Spectral => &self.spectral,
        }
    }
}
