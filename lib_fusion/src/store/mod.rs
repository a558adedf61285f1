//! # Sample Store Contract
//!
//! The narrow persistence surface the ingestion path depends on. Concrete
//! backends live elsewhere (`memory` here, PostgreSQL under `connections`);
//! callers only see [`SampleStore`] behind an `Arc<dyn SampleStore>`.
//!
//! [`StoreError`] knows which of its variants mean "the store is unhealthy"
//! and therefore count against the circuit breaker.

use async_trait::async_trait;

use crate::core::circuit_breaker::{ClassifyFailure, FailureClass};
use crate::models::{Alert, FusionSample};

/// In-process store for tests and single-node deployments.
pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or dropped the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer in time.
    #[error("store timed out: {0}")]
    Timeout(String),
    /// A uniqueness or foreign-key rule rejected the write.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// The record could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The backend rejected the statement itself.
    #[error("query failed: {0}")]
    Query(String),
}

impl ClassifyFailure for StoreError {
    fn failure_class(&self) -> FailureClass {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => FailureClass::Counted,
            StoreError::Integrity(_) | StoreError::Serialization(_) | StoreError::Query(_) => {
                FailureClass::Passthrough
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable storage for samples and alerts.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Persists a new sample. Sample ids are unique.
    async fn save_sample(&self, sample: &FusionSample) -> Result<(), StoreError>;

    /// The most recently saved sample, if any.
    async fn get_latest_sample(&self) -> Result<Option<FusionSample>, StoreError>;

    /// Persists an alert. Its `sample_id` must reference a saved sample.
    async fn create_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Cheap round-trip used by the readiness probe.
    async fn ping(&self) -> Result<(), StoreError> {
        self.get_latest_sample().await.map(|_| ())
    }
}
