//! # Alert Rules
//!
//! Turns a persisted fusion sample into zero or more alert records. The engine
//! performs no I/O; storing and broadcasting the alerts is the caller's job.

/// The rule evaluator.
pub mod engine;

pub use engine::{AlertEngine, AlertThresholds};
