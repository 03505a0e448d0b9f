#![allow(dead_code)]

use compliance_core::access::{AccessAction, AccessRequest, ReasonCategory};
use compliance_core::api::AppState;
use compliance_core::config::HealthPolicy;
use compliance_core::database::Database;
use compliance_core::external::InMemoryClinicalStore;
use std::sync::Arc;

pub struct Harness {
    pub db: Database,
    pub clinical: Arc<InMemoryClinicalStore>,
    pub state: AppState,
}

/// Setup every component over an in-memory SQLite database
pub async fn setup() -> Harness {
    let db = Database::new_in_memory().await.expect("Failed to create test database");
    setup_with(db).await
}

pub async fn setup_with(db: Database) -> Harness {
    let clinical = Arc::new(InMemoryClinicalStore::new());
    clinical.add_patient("clinic-a", "p-a1");
    clinical.add_patient("clinic-a", "p-a2");
    clinical.add_patient("clinic-b", "p-b1");
    let state = AppState::new(db.clone(), clinical.clone(), HealthPolicy::default());
    Harness { db, clinical, state }
}

/// A justified care access by `dr-<tenant>` to a patient
pub fn care_access(tenant: &str, patient: &str) -> AccessRequest {
    AccessRequest::new(
        format!("dr-{}", tenant),
        tenant,
        "patient",
        Some(patient.to_string()),
        AccessAction::View,
    )
    .fields(["name", "allergies"])
    .reason("scheduled consultation", ReasonCategory::Care)
}

/// Edit a stored ledger row behind the store's back
pub async fn tamper(db: &Database, sql: &str) {
    sqlx::query("DROP TRIGGER IF EXISTS ledger_entries_no_update")
        .execute(db.pool())
        .await
        .expect("Failed to drop update trigger");
    sqlx::query("DROP TRIGGER IF EXISTS ledger_entries_no_delete")
        .execute(db.pool())
        .await
        .expect("Failed to drop delete trigger");
    sqlx::query(sql).execute(db.pool()).await.expect("Failed to tamper");
}

/// Mark every configured sensitive field as encrypted
pub fn encrypt_sensitive_fields(clinical: &InMemoryClinicalStore) {
    for (resource_type, fields) in &HealthPolicy::default().sensitive_fields {
        for field in fields {
            clinical.mark_encrypted(resource_type, field);
        }
    }
}
