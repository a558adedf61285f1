//! # Data Model
//!
//! Records that flow through the ingestion path. A [`FusionSample`] is created
//! once by the device session after it has been validated and persisted, and is
//! never mutated afterwards. An [`Alert`] references exactly one sample and its
//! only later mutation is acknowledgement.

/// Scored sensor readings and their grade scale.
pub mod sample;
/// Alert records produced by the rule engine.
pub mod alert;

pub use alert::{Alert, AlertType, Severity};
pub use sample::{FusionSample, Grade, SensorBlock, SensorKind};
