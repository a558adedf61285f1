use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{SampleStore, StoreError};
use crate::models::{Alert, FusionSample};

#[derive(Debug, Default)]
struct Tables {
    samples: Vec<FusionSample>,
    alerts: Vec<Alert>,
}

/// Lock-protected vectors. The newest sample is the last one saved.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn samples(&self) -> Vec<FusionSample> {
        self.lock().samples.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    pub fn sample(&self, sample_id: &str) -> Option<FusionSample> {
        self.lock()
            .samples
            .iter()
            .find(|s| s.sample_id == sample_id)
            .cloned()
    }

    /// Acknowledges an alert. `Ok(false)` if it was already acknowledged.
    pub fn acknowledge_alert(
        &self,
        alert_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let alert = tables
            .alerts
            .iter_mut()
            .find(|a| a.alert_id == alert_id)
            .ok_or_else(|| StoreError::Query(format!("no alert '{}'", alert_id)))?;
        Ok(alert.acknowledge(by, at))
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn save_sample(&self, sample: &FusionSample) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if tables.samples.iter().any(|s| s.sample_id == sample.sample_id) {
            return Err(StoreError::Integrity(format!(
                "sample '{}' already exists",
                sample.sample_id
            )));
        }
        tables.samples.push(sample.clone());
        Ok(())
    }

    async fn get_latest_sample(&self) -> Result<Option<FusionSample>, StoreError> {
        Ok(self.lock().samples.last().cloned())
    }

    async fn create_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if !tables.samples.iter().any(|s| s.sample_id == alert.sample_id) {
            return Err(StoreError::Integrity(format!(
                "alert '{}' references unknown sample '{}'",
                alert.alert_id, alert.sample_id
            )));
        }
        if tables.alerts.iter().any(|a| a.alert_id == alert.alert_id) {
            return Err(StoreError::Integrity(format!(
                "alert '{}' already exists",
                alert.alert_id
            )));
        }
        tables.alerts.push(alert.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertType, Grade, SensorBlock, Severity};
    use serde_json::Map;

    fn sample(id: &str) -> FusionSample {
        FusionSample {
            sample_id: id.into(),
            device_id: "dev-1".into(),
            site_id: None,
            firmware_version: None,
            timestamp: Utc::now(),
            tof_score: None,
            spectral_score: None,
            final_score: 0.9,
            final_grade: Grade::A,
            defects: vec![],
            compliance: true,
            geometry: SensorBlock::default(),
            spectral: SensorBlock::default(),
        }
    }

    fn alert(sample_id: &str) -> Alert {
        Alert {
            alert_id: format!("{}:quality_low", sample_id),
            sample_id: sample_id.into(),
            device_id: "dev-1".into(),
            alert_type: AlertType::QualityLow,
            severity: Severity::Warning,
            message: "low".into(),
            context: Map::new(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }

    #[tokio::test]
    async fn latest_is_last_saved() {
        let store = MemoryStore::new();
        assert!(store.get_latest_sample().await.unwrap().is_none());
        store.save_sample(&sample("s-1")).await.unwrap();
        store.save_sample(&sample("s-2")).await.unwrap();
        let latest = store.get_latest_sample().await.unwrap().unwrap();
        assert_eq!(latest.sample_id, "s-2");
    }

    #[tokio::test]
    async fn duplicate_sample_is_integrity_error() {
        let store = MemoryStore::new();
        store.save_sample(&sample("s-1")).await.unwrap();
        let err = store.save_sample(&sample("s-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn alert_requires_existing_sample() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create_alert(&alert("ghost")).await,
            Err(StoreError::Integrity(_))
        ));
        store.save_sample(&sample("s-1")).await.unwrap();
        store.create_alert(&alert("s-1")).await.unwrap();
        assert_eq!(store.alerts().len(), 1);
    }

    #[tokio::test]
    async fn first_acknowledger_wins() {
        let store = MemoryStore::new();
        store.save_sample(&sample("s-1")).await.unwrap();
        store.create_alert(&alert("s-1")).await.unwrap();

        let id = "s-1:quality_low";
        assert!(store.acknowledge_alert(id, "alice", Utc::now()).unwrap());
        assert!(!store.acknowledge_alert(id, "bob", Utc::now()).unwrap());
        assert_eq!(store.alerts()[0].acknowledged_by.as_deref(), Some("alice"));
        assert!(store.acknowledge_alert("nope", "x", Utc::now()).is_err());
    }
}
