//! Subject data export for data-subject access requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::access::{AccessFilter, AccessRecord};
use crate::consent::{ConsentAudit, ConsentRecord};
use crate::database::now;
use crate::error::{ComplianceError, ComplianceResult};
use crate::ledger::store::entry_from_row;
use crate::ledger::{EventType, LedgerDraft, LedgerEntry};
use crate::report::certification::ReportGenerator;

/// Everything the compliance core holds about one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectExport {
    pub tenant_id: String,
    pub patient_id: String,
    pub requested_by: String,
    pub generated_at: DateTime<Utc>,
    pub consent_records: Vec<ConsentRecord>,
    pub consent_history: Vec<ConsentAudit>,
    pub access_records: Vec<AccessRecord>,
    pub ledger_entries: Vec<LedgerEntry>,
}

impl ReportGenerator {
    /// Assemble the export, then record that it happened.
    pub async fn export_subject_data(
        &self,
        tenant_id: &str,
        patient_id: &str,
        requested_by: &str,
    ) -> ComplianceResult<SubjectExport> {
        if patient_id.trim().is_empty() || requested_by.trim().is_empty() {
            return Err(ComplianceError::invalid_input("patient_id and requested_by are required"));
        }

        let consent_records = self.consent.records_for_patient(tenant_id, patient_id).await?;
        let consent_history = self.consent.patient_history(tenant_id, patient_id).await?;
        let access_records = self
            .access
            .list(tenant_id, &AccessFilter::default().resource("patient", patient_id))
            .await?;
        let ledger_entries = self.entries_referencing(tenant_id, patient_id).await?;

        let export = SubjectExport {
            tenant_id: tenant_id.to_string(),
            patient_id: patient_id.to_string(),
            requested_by: requested_by.to_string(),
            generated_at: now(),
            consent_records,
            consent_history,
            access_records,
            ledger_entries,
        };

        self.ledger
            .append(
                tenant_id,
                LedgerDraft::new(EventType::Export, "patient", "subject_export")
                    .actor(requested_by)
                    .resource_id(patient_id)
                    .new_value(json!({
                        "consent_records": export.consent_records.len(),
                        "access_records": export.access_records.len(),
                        "ledger_entries": export.ledger_entries.len(),
                    })),
            )
            .await?;

        info!(
            "Subject export of patient {} in tenant {} by {}: {} ledger entries",
            patient_id,
            tenant_id,
            requested_by,
            export.ledger_entries.len()
        );
        Ok(export)
    }

    /// Entries about the patient resource itself or carrying its id in their payload.
    async fn entries_referencing(&self, tenant_id: &str, patient_id: &str) -> ComplianceResult<Vec<LedgerEntry>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM ledger_entries
                WHERE tenant_id = ?
                  AND ((resource_type = 'patient' AND resource_id = ?)
                       OR json_extract(new_value, '$.patient_id') = ?
                       OR json_extract(previous_value, '$.patient_id') = ?)
                ORDER BY sequence_no ASC
                "#,
            )
            .bind(tenant_id)
            .bind(patient_id)
            .bind(patient_id)
            .bind(patient_id)
            .fetch_all(db.pool())
            .await?;
            rows.iter().map(entry_from_row).collect()
        })
        .await
    }
}
