//! # Device Ingestors Module
//!
//! The front door for sensor readings. Each connected device gets its own
//! [`DeviceIngestionSession`], driven by [`run_device_session`], which turns
//! inbound JSON frames into persisted samples, alerts, dashboard broadcasts
//! and acknowledgements.
//!
//! ## Contained Modules:
//! - **`protocol`**: The device wire frames and the error taxonomy with its
//!   stable reply codes.
//! - **`session`**: The handshake state machine, the per-frame pipeline and
//!   the transport-agnostic connection driver.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Device wire frames and error replies.
pub mod protocol;
/// Per-connection ingestion session.
pub mod session;

pub use protocol::{DeviceInbound, DeviceOutbound, IngestError};
pub use session::{DeviceIngestionSession, SessionState, run_device_session};
