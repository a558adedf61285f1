//! Ingestion core of the fusion sensor gateway.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod broadcast;
pub mod core;
pub mod ingestors;
pub mod models;
pub mod services;
pub mod store;

#[cfg(feature = "connections")]
pub mod connections;

pub use alerts::{AlertEngine, AlertThresholds};
pub use broadcast::{BroadcasterConfig, RealtimeBroadcaster, SubscriptionFilter, run_dashboard_session};
pub use ingestors::{DeviceIngestionSession, IngestError, run_device_session};
pub use models::{Alert, AlertType, FusionSample, Grade, Severity};
pub use services::{GatewayStatus, IngestionServices, ServicesConfig};
pub use store::{MemoryStore, SampleStore, StoreError};
