//! Clinical data store interface
//!
//! Read-only view of the primary clinical store: who owns a resource,
//! how much activity a tenant had, which patients are active, and which
//! fields the schema marks as encrypted. Clinical content never crosses
//! this boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

use crate::error::{ComplianceError, ComplianceResult};

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ComplianceResult<Self> {
        if end <= start {
            return Err(ComplianceError::invalid_input(format!(
                "period end {} must be after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }
}

#[async_trait]
pub trait ClinicalDataStore: Send + Sync {
    async fn resource_owner_tenant(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> ComplianceResult<Option<String>>;

    /// Activity counts keyed by kind (`patients`, `consultations`, ...).
    async fn counts(&self, tenant_id: &str, period: &Period) -> ComplianceResult<BTreeMap<String, u64>>;

    async fn active_patients(&self, tenant_id: &str) -> ComplianceResult<Vec<String>>;

    /// Fields the schema metadata marks as encrypted for a resource type.
    async fn encrypted_fields(&self, resource_type: &str) -> ComplianceResult<BTreeSet<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOwnership {
    pub resource_type: String,
    pub resource_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalActivity {
    pub tenant_id: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
}

/// Serializable picture of the clinical store's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalSnapshot {
    pub resources: Vec<ResourceOwnership>,
    pub active_patients: BTreeMap<String, BTreeSet<String>>,
    pub activity: Vec<ClinicalActivity>,
    pub encrypted_fields: BTreeMap<String, BTreeSet<String>>,
}

/// Clinical store backed by an in-process snapshot.
#[derive(Debug, Default)]
pub struct InMemoryClinicalStore {
    snapshot: RwLock<ClinicalSnapshot>,
}

impl InMemoryClinicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ClinicalSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn load_yaml(path: &Path) -> ComplianceResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ComplianceError::ConfigError(format!("Failed to read clinical snapshot {:?}: {}", path, e))
        })?;
        let snapshot: ClinicalSnapshot = serde_yaml::from_str(&contents).map_err(|e| {
            ComplianceError::ConfigError(format!("Failed to parse clinical snapshot {:?}: {}", path, e))
        })?;
        info!(
            "Loaded clinical snapshot with {} resources from {:?}",
            snapshot.resources.len(),
            path
        );
        Ok(Self::from_snapshot(snapshot))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ClinicalSnapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ClinicalSnapshot> {
        self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_resource(&self, resource_type: &str, resource_id: &str, tenant_id: &str) {
        self.write().resources.push(ResourceOwnership {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            tenant_id: tenant_id.to_string(),
        });
    }

    /// Registers an active patient and its ownership.
    pub fn add_patient(&self, tenant_id: &str, patient_id: &str) {
        self.add_resource("patient", patient_id, tenant_id);
        self.write()
            .active_patients
            .entry(tenant_id.to_string())
            .or_default()
            .insert(patient_id.to_string());
    }

    pub fn record_activity(&self, tenant_id: &str, kind: &str, occurred_at: DateTime<Utc>) {
        self.write().activity.push(ClinicalActivity {
            tenant_id: tenant_id.to_string(),
            kind: kind.to_string(),
            occurred_at,
        });
    }

    pub fn mark_encrypted(&self, resource_type: &str, field: &str) {
        self.write()
            .encrypted_fields
            .entry(resource_type.to_string())
            .or_default()
            .insert(field.to_string());
    }
}

#[async_trait]
impl ClinicalDataStore for InMemoryClinicalStore {
    async fn resource_owner_tenant(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> ComplianceResult<Option<String>> {
        Ok(self
            .read()
            .resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.resource_id == resource_id)
            .map(|r| r.tenant_id.clone()))
    }

    async fn counts(&self, tenant_id: &str, period: &Period) -> ComplianceResult<BTreeMap<String, u64>> {
        let snapshot = self.read();
        let mut counts = BTreeMap::new();
        counts.insert(
            "patients".to_string(),
            snapshot.active_patients.get(tenant_id).map(|p| p.len() as u64).unwrap_or(0),
        );
        for activity in snapshot
            .activity
            .iter()
            .filter(|a| a.tenant_id == tenant_id && period.contains(&a.occurred_at))
        {
            *counts.entry(activity.kind.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn active_patients(&self, tenant_id: &str) -> ComplianceResult<Vec<String>> {
        Ok(self
            .read()
            .active_patients
            .get(tenant_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn encrypted_fields(&self, resource_type: &str) -> ComplianceResult<BTreeSet<String>> {
        Ok(self.read().encrypted_fields.get(resource_type).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_rejects_inverted_bounds() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert!(Period::new(start, start).is_err());
        let period = Period::new(start, start + chrono::Duration::days(1)).unwrap();
        assert!(period.contains(&start));
        assert!(!period.contains(&period.end));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryClinicalStore::new();
        store.add_patient("clinic-a", "p-1");
        store.add_resource("document", "d-9", "clinic-b");
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        store.record_activity("clinic-a", "consultations", start + chrono::Duration::hours(2));
        store.record_activity("clinic-a", "consultations", start - chrono::Duration::hours(2));

        assert_eq!(
            store.resource_owner_tenant("patient", "p-1").await.unwrap().as_deref(),
            Some("clinic-a")
        );
        assert_eq!(
            store.resource_owner_tenant("document", "d-9").await.unwrap().as_deref(),
            Some("clinic-b")
        );
        assert_eq!(store.resource_owner_tenant("document", "nope").await.unwrap(), None);

        let period = Period::new(start, start + chrono::Duration::days(1)).unwrap();
        let counts = store.counts("clinic-a", &period).await.unwrap();
        assert_eq!(counts.get("patients"), Some(&1));
        assert_eq!(counts.get("consultations"), Some(&1));
    }

    #[test]
    fn test_snapshot_yaml() {
        let yaml = r#"
resources:
  - resource_type: patient
    resource_id: p-1
    tenant_id: clinic-a
active_patients:
  clinic-a: [p-1]
encrypted_fields:
  patient: [date_of_birth]
"#;
        let snapshot: ClinicalSnapshot = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert!(snapshot.activity.is_empty());
        assert!(snapshot.encrypted_fields["patient"].contains("date_of_birth"));
    }
}
