//! Consent Tracker
//!
//! Finite-state consent per (tenant, patient, consent type). Every status
//! change writes one `consent_audit` row and one `data_modification` ledger
//! entry in the same transaction as the record itself. The tenant write
//! session also serializes competing transitions on the same patient.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use crate::consent::types::{Acknowledgment, ConsentAudit, ConsentRecord, ConsentStatus, ConsentTemplate};
use crate::database::{encode_time, now};
use crate::error::{ComplianceError, ComplianceResult, ValidationError};
use crate::ledger::{EventType, LedgerDraft, LedgerStore, LedgerTxn};

#[derive(Clone)]
pub struct ConsentTracker {
    ledger: LedgerStore,
}

/// One requested status change, before it is checked against the current record.
struct Change<'a> {
    tenant_id: &'a str,
    patient_id: &'a str,
    consent_type: &'a str,
    actor_id: &'a str,
    to: ConsentStatus,
    reason: Option<&'a str>,
    signature: Option<&'a Value>,
}

impl ConsentTracker {
    pub fn new(ledger: LedgerStore) -> Self {
        Self { ledger }
    }

    /// Register a new template version; versions are numbered per (tenant, type) from 1.
    pub async fn register_template(
        &self,
        tenant_id: &str,
        consent_type: &str,
        title: &str,
        required_for_care: bool,
        actor_id: &str,
    ) -> ComplianceResult<ConsentTemplate> {
        if consent_type.trim().is_empty() {
            return Err(ComplianceError::invalid_input("consent_type must not be empty"));
        }

        let mut txn = self.ledger.begin(tenant_id).await?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS v FROM consent_templates WHERE tenant_id = ? AND consent_type = ?",
        )
        .bind(tenant_id)
        .bind(consent_type)
        .fetch_one(&mut *txn.conn())
        .await?;
        let version: i64 = row.get::<i64, _>("v") + 1;

        // Older versions stop being offered once a new one exists.
        sqlx::query("UPDATE consent_templates SET active = 0 WHERE tenant_id = ? AND consent_type = ?")
            .bind(tenant_id)
            .bind(consent_type)
            .execute(&mut *txn.conn())
            .await?;

        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO consent_templates (tenant_id, consent_type, version, title, required_for_care, active, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(consent_type)
        .bind(version)
        .bind(title)
        .bind(required_for_care)
        .bind(encode_time(&created_at))
        .execute(&mut *txn.conn())
        .await?;
        let id = result.last_insert_rowid();

        txn.append(
            LedgerDraft::new(EventType::DataModification, "consent_template", "register")
                .actor(actor_id)
                .resource_id(id.to_string())
                .new_value(json!({
                    "consent_type": consent_type,
                    "version": version,
                    "required_for_care": required_for_care,
                })),
        )
        .await?;
        txn.commit().await?;

        info!(
            "Registered consent template {} v{} for tenant {} (required: {})",
            consent_type, version, tenant_id, required_for_care
        );
        Ok(ConsentTemplate {
            id,
            tenant_id: tenant_id.to_string(),
            consent_type: consent_type.to_string(),
            version,
            title: title.to_string(),
            required_for_care,
            active: true,
            created_at,
        })
    }

    /// Open a pending record for a patient.
    pub async fn request(
        &self,
        tenant_id: &str,
        patient_id: &str,
        consent_type: &str,
        actor_id: &str,
    ) -> ComplianceResult<ConsentRecord> {
        self.apply(Change {
            tenant_id,
            patient_id,
            consent_type,
            actor_id,
            to: ConsentStatus::Pending,
            reason: None,
            signature: None,
        })
        .await
    }

    pub async fn obtain(
        &self,
        tenant_id: &str,
        patient_id: &str,
        consent_type: &str,
        actor_id: &str,
        acknowledgment: Acknowledgment,
        signature: Option<Value>,
    ) -> ComplianceResult<ConsentRecord> {
        acknowledgment.validate()?;
        self.apply(Change {
            tenant_id,
            patient_id,
            consent_type,
            actor_id,
            to: ConsentStatus::Obtained,
            reason: None,
            signature: signature.as_ref(),
        })
        .await
    }

    pub async fn refuse(
        &self,
        tenant_id: &str,
        patient_id: &str,
        consent_type: &str,
        actor_id: &str,
        reason: &str,
    ) -> ComplianceResult<ConsentRecord> {
        if reason.trim().is_empty() {
            return Err(ValidationError::MissingReason.into());
        }
        self.apply(Change {
            tenant_id,
            patient_id,
            consent_type,
            actor_id,
            to: ConsentStatus::Refused,
            reason: Some(reason),
            signature: None,
        })
        .await
    }

    /// obtained -> revoked; any other current status is an `InvalidTransition`.
    pub async fn revoke(&self, consent_id: i64, reason: &str, revoked_by: &str) -> ComplianceResult<ConsentRecord> {
        if reason.trim().is_empty() {
            return Err(ValidationError::MissingReason.into());
        }
        let record = self.get(consent_id).await?;

        let mut txn = self.ledger.begin(&record.tenant_id).await?;
        // Re-read under the tenant lock.
        let record = load_record(txn.conn(), consent_id).await?;
        if !record.status.can_transition_to(ConsentStatus::Revoked) {
            return Err(ComplianceError::InvalidTransition {
                current: record.status,
                requested: ConsentStatus::Revoked,
            });
        }

        let revoked_at = now();
        sqlx::query(
            r#"
            UPDATE consent_records SET status = ?, revoked_at = ?, revoked_by = ?, revocation_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(ConsentStatus::Revoked.as_str())
        .bind(encode_time(&revoked_at))
        .bind(revoked_by)
        .bind(reason)
        .bind(consent_id)
        .execute(&mut *txn.conn())
        .await?;

        let updated = ConsentRecord {
            status: ConsentStatus::Revoked,
            revoked_at: Some(revoked_at),
            revoked_by: Some(revoked_by.to_string()),
            revocation_reason: Some(reason.to_string()),
            ..record
        };
        record_change(&mut txn, &updated, Some(ConsentStatus::Obtained), revoked_by, Some(reason), revoked_at).await?;
        txn.commit().await?;

        info!(
            "Consent {} ({}) for patient {} revoked by {}",
            consent_id, updated.consent_type, updated.patient_id, revoked_by
        );
        Ok(updated)
    }

    async fn apply(&self, change: Change<'_>) -> ComplianceResult<ConsentRecord> {
        if change.patient_id.trim().is_empty() || change.actor_id.trim().is_empty() {
            return Err(ComplianceError::invalid_input("patient_id and actor_id are required"));
        }

        let mut txn = self.ledger.begin(change.tenant_id).await?;
        let current = current_record(txn.conn(), change.tenant_id, change.patient_id, change.consent_type).await?;
        let at = now();

        let (record, previous) = match current.filter(|r| !r.status.is_terminal()) {
            Some(existing) if existing.status.can_transition_to(change.to) => {
                let previous = existing.status;
                let updated = update_status(txn.conn(), existing, &change, at).await?;
                (updated, Some(previous))
            }
            Some(existing) => {
                return Err(ComplianceError::InvalidTransition {
                    current: existing.status,
                    requested: change.to,
                });
            }
            // Absence behaves as pending.
            None => (insert_record(txn.conn(), &change, at).await?, None),
        };

        record_change(&mut txn, &record, previous, change.actor_id, change.reason, at).await?;
        txn.commit().await?;

        info!(
            "Consent {} ({}) for patient {} in tenant {} is now {}",
            record.id, record.consent_type, record.patient_id, record.tenant_id, record.status
        );
        Ok(record)
    }

    pub async fn get(&self, consent_id: i64) -> ComplianceResult<ConsentRecord> {
        let db = self.ledger.database();
        db.bounded(async {
            let mut conn = db.pool().acquire().await?;
            load_record(&mut conn, consent_id).await
        })
        .await
    }

    /// Latest record for (patient, consent type), whatever its status.
    pub async fn current(
        &self,
        tenant_id: &str,
        patient_id: &str,
        consent_type: &str,
    ) -> ComplianceResult<Option<ConsentRecord>> {
        let db = self.ledger.database();
        db.bounded(async {
            let mut conn = db.pool().acquire().await?;
            current_record(&mut conn, tenant_id, patient_id, consent_type).await
        })
        .await
    }

    /// Audit trail of one consent record, oldest first.
    pub async fn history(&self, consent_id: i64) -> ComplianceResult<Vec<ConsentAudit>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query("SELECT * FROM consent_audit WHERE consent_id = ? ORDER BY id ASC")
                .bind(consent_id)
                .fetch_all(db.pool())
                .await?;
            rows.iter().map(ConsentAudit::from_row).collect()
        })
        .await
    }

    pub async fn patient_history(&self, tenant_id: &str, patient_id: &str) -> ComplianceResult<Vec<ConsentAudit>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query("SELECT * FROM consent_audit WHERE tenant_id = ? AND patient_id = ? ORDER BY id ASC")
                .bind(tenant_id)
                .bind(patient_id)
                .fetch_all(db.pool())
                .await?;
            rows.iter().map(ConsentAudit::from_row).collect()
        })
        .await
    }

    pub async fn records_for_patient(&self, tenant_id: &str, patient_id: &str) -> ComplianceResult<Vec<ConsentRecord>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query("SELECT * FROM consent_records WHERE tenant_id = ? AND patient_id = ? ORDER BY id ASC")
                .bind(tenant_id)
                .bind(patient_id)
                .fetch_all(db.pool())
                .await?;
            rows.iter().map(ConsentRecord::from_row).collect()
        })
        .await
    }

    /// Active templates flagged required for care.
    pub async fn required_templates(&self, tenant_id: &str) -> ComplianceResult<Vec<ConsentTemplate>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM consent_templates
                WHERE tenant_id = ? AND active = 1 AND required_for_care = 1
                ORDER BY consent_type ASC
                "#,
            )
            .bind(tenant_id)
            .fetch_all(db.pool())
            .await?;
            rows.iter().map(ConsentTemplate::from_row).collect()
        })
        .await
    }

    /// Required-for-care templates the patient has no current `obtained` record for.
    pub async fn missing_required(&self, tenant_id: &str, patient_id: &str) -> ComplianceResult<Vec<ConsentTemplate>> {
        let mut missing = Vec::new();
        for template in self.required_templates(tenant_id).await? {
            let current = self.current(tenant_id, patient_id, &template.consent_type).await?;
            if current.map(|r| r.status) != Some(ConsentStatus::Obtained) {
                missing.push(template);
            }
        }
        debug!(
            "Patient {} in tenant {} is missing {} required consents",
            patient_id,
            tenant_id,
            missing.len()
        );
        Ok(missing)
    }

    /// Records created within `[since, until)`.
    pub async fn count_between(
        &self,
        tenant_id: &str,
        since: &DateTime<Utc>,
        until: &DateTime<Utc>,
    ) -> ComplianceResult<i64> {
        let db = self.ledger.database();
        db.bounded(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n FROM consent_records WHERE tenant_id = ? AND created_at >= ? AND created_at < ?",
            )
            .bind(tenant_id)
            .bind(encode_time(since))
            .bind(encode_time(until))
            .fetch_one(db.pool())
            .await?;
            Ok(row.get("n"))
        })
        .await
    }
}

async fn load_record(conn: &mut SqliteConnection, consent_id: i64) -> ComplianceResult<ConsentRecord> {
    let row = sqlx::query("SELECT * FROM consent_records WHERE id = ?")
        .bind(consent_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ComplianceError::not_found(format!("consent record {}", consent_id)))?;
    ConsentRecord::from_row(&row)
}

async fn current_record(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    patient_id: &str,
    consent_type: &str,
) -> ComplianceResult<Option<ConsentRecord>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM consent_records
        WHERE tenant_id = ? AND patient_id = ? AND consent_type = ?
        ORDER BY id DESC LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(patient_id)
    .bind(consent_type)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(ConsentRecord::from_row).transpose()
}

async fn active_template(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    consent_type: &str,
) -> ComplianceResult<ConsentTemplate> {
    let row = sqlx::query(
        r#"
        SELECT * FROM consent_templates
        WHERE tenant_id = ? AND consent_type = ? AND active = 1
        ORDER BY version DESC LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(consent_type)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ComplianceError::not_found(format!("consent template {} for tenant {}", consent_type, tenant_id)))?;
    ConsentTemplate::from_row(&row)
}

async fn insert_record(conn: &mut SqliteConnection, change: &Change<'_>, at: DateTime<Utc>) -> ComplianceResult<ConsentRecord> {
    let template = active_template(conn, change.tenant_id, change.consent_type).await?;
    let mut record = ConsentRecord {
        id: 0,
        tenant_id: change.tenant_id.to_string(),
        patient_id: change.patient_id.to_string(),
        template_id: template.id,
        consent_type: change.consent_type.to_string(),
        status: change.to,
        actor_id: change.actor_id.to_string(),
        created_at: at,
        obtained_at: None,
        refused_at: None,
        revoked_at: None,
        revoked_by: None,
        refusal_reason: None,
        revocation_reason: None,
        signature: None,
    };
    stamp(&mut record, change, at);

    let result = sqlx::query(
        r#"
        INSERT INTO consent_records
        (tenant_id, patient_id, template_id, consent_type, status, actor_id, created_at,
         obtained_at, refused_at, refusal_reason, signature)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.tenant_id)
    .bind(&record.patient_id)
    .bind(record.template_id)
    .bind(&record.consent_type)
    .bind(record.status.as_str())
    .bind(&record.actor_id)
    .bind(encode_time(&record.created_at))
    .bind(record.obtained_at.as_ref().map(encode_time))
    .bind(record.refused_at.as_ref().map(encode_time))
    .bind(&record.refusal_reason)
    .bind(record.signature.as_ref().map(|s| s.to_string()))
    .execute(&mut *conn)
    .await?;

    record.id = result.last_insert_rowid();
    Ok(record)
}

async fn update_status(
    conn: &mut SqliteConnection,
    mut record: ConsentRecord,
    change: &Change<'_>,
    at: DateTime<Utc>,
) -> ComplianceResult<ConsentRecord> {
    record.status = change.to;
    record.actor_id = change.actor_id.to_string();
    stamp(&mut record, change, at);

    sqlx::query(
        r#"
        UPDATE consent_records
        SET status = ?, actor_id = ?, obtained_at = ?, refused_at = ?, refusal_reason = ?, signature = ?
        WHERE id = ?
        "#,
    )
    .bind(record.status.as_str())
    .bind(&record.actor_id)
    .bind(record.obtained_at.as_ref().map(encode_time))
    .bind(record.refused_at.as_ref().map(encode_time))
    .bind(&record.refusal_reason)
    .bind(record.signature.as_ref().map(|s| s.to_string()))
    .bind(record.id)
    .execute(&mut *conn)
    .await?;
    Ok(record)
}

fn stamp(record: &mut ConsentRecord, change: &Change<'_>, at: DateTime<Utc>) {
    match change.to {
        ConsentStatus::Obtained => {
            record.obtained_at = Some(at);
            record.signature = change.signature.cloned();
        }
        ConsentStatus::Refused => {
            record.refused_at = Some(at);
            record.refusal_reason = change.reason.map(str::to_string);
        }
        ConsentStatus::Pending | ConsentStatus::Revoked => {}
    }
}

/// Audit row plus ledger entry for one status change.
async fn record_change(
    txn: &mut LedgerTxn,
    record: &ConsentRecord,
    previous: Option<ConsentStatus>,
    actor_id: &str,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> ComplianceResult<()> {
    let entry = txn
        .append(
            LedgerDraft::new(EventType::DataModification, "consent", record.status.as_str())
                .actor(actor_id)
                .resource_id(record.id.to_string())
                .previous_value(json!({ "status": previous.map(|s| s.as_str()) }))
                .new_value(json!({
                    "status": record.status.as_str(),
                    "patient_id": record.patient_id,
                    "consent_type": record.consent_type,
                    "template_id": record.template_id,
                })),
        )
        .await?;

    sqlx::query(
        r#"
        INSERT INTO consent_audit
        (consent_id, tenant_id, patient_id, consent_type, previous_status, new_status, actor_id, reason,
         ledger_sequence_no, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id)
    .bind(&record.tenant_id)
    .bind(&record.patient_id)
    .bind(&record.consent_type)
    .bind(previous.map(|s| s.as_str()))
    .bind(record.status.as_str())
    .bind(actor_id)
    .bind(reason)
    .bind(entry.sequence_no)
    .bind(encode_time(&at))
    .execute(txn.conn())
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::ledger::LedgerFilter;

    async fn tracker() -> (ConsentTracker, LedgerStore) {
        let ledger = LedgerStore::new(Database::new_in_memory().await.unwrap());
        let tracker = ConsentTracker::new(ledger.clone());
        tracker
            .register_template("clinic-a", "treatment", "Consent to treatment", true, "admin")
            .await
            .unwrap();
        tracker
            .register_template("clinic-a", "newsletter", "Newsletter", false, "admin")
            .await
            .unwrap();
        (tracker, ledger)
    }

    #[tokio::test]
    async fn test_obtain_from_absence() {
        let (tracker, ledger) = tracker().await;
        let record = tracker
            .obtain("clinic-a", "p-1", "treatment", "nurse-1", Acknowledgment::complete(), Some(json!({"sig": "abc"})))
            .await
            .unwrap();
        assert_eq!(record.status, ConsentStatus::Obtained);
        assert!(record.obtained_at.is_some());
        assert_eq!(tracker.get(record.id).await.unwrap(), record);

        let history = tracker.history(record.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_status, None);
        assert_eq!(history[0].new_status, ConsentStatus::Obtained);

        let entry = &ledger
            .read("clinic-a", &LedgerFilter::default().resource("consent", Some(record.id.to_string())))
            .await
            .unwrap()[0];
        assert_eq!(entry.event_type, EventType::DataModification);
        assert_eq!(entry.sequence_no, history[0].ledger_sequence_no);
    }

    #[tokio::test]
    async fn test_incomplete_acknowledgment_writes_nothing() {
        let (tracker, ledger) = tracker().await;
        let before = ledger.count("clinic-a").await.unwrap();
        let ack = Acknowledgment {
            scroll_completed: true,
            checkbox_confirmed: false,
        };
        let err = tracker
            .obtain("clinic-a", "p-1", "treatment", "nurse-1", ack, None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(ledger.count("clinic-a").await.unwrap(), before);
        assert!(tracker.current("clinic-a", "p-1", "treatment").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_then_refused() {
        let (tracker, _) = tracker().await;
        let pending = tracker.request("clinic-a", "p-1", "treatment", "nurse-1").await.unwrap();
        assert_eq!(pending.status, ConsentStatus::Pending);

        let err = tracker.refuse("clinic-a", "p-1", "treatment", "nurse-1", " ").await.unwrap_err();
        assert!(matches!(err, ComplianceError::Validation(ValidationError::MissingReason)));

        let refused = tracker
            .refuse("clinic-a", "p-1", "treatment", "nurse-1", "prefers another clinic")
            .await
            .unwrap();
        assert_eq!(refused.id, pending.id);
        assert_eq!(refused.status, ConsentStatus::Refused);
        assert_eq!(tracker.history(pending.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_rules() {
        let (tracker, _) = tracker().await;
        let pending = tracker.request("clinic-a", "p-1", "treatment", "nurse-1").await.unwrap();
        let err = tracker.revoke(pending.id, "changed mind", "nurse-1").await.unwrap_err();
        assert!(matches!(
            err,
            ComplianceError::InvalidTransition {
                current: ConsentStatus::Pending,
                requested: ConsentStatus::Revoked
            }
        ));

        let obtained = tracker
            .obtain("clinic-a", "p-1", "treatment", "nurse-1", Acknowledgment::complete(), None)
            .await
            .unwrap();
        assert!(tracker.missing_required("clinic-a", "p-1").await.unwrap().is_empty());

        let revoked = tracker.revoke(obtained.id, "patient request", "dr-b").await.unwrap();
        assert_eq!(revoked.status, ConsentStatus::Revoked);
        assert_eq!(revoked.revoked_by.as_deref(), Some("dr-b"));

        let missing = tracker.missing_required("clinic-a", "p-1").await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].consent_type, "treatment");

        // Revoked is terminal.
        assert!(tracker.revoke(obtained.id, "again", "dr-b").await.is_err());
    }

    #[tokio::test]
    async fn test_obtained_cannot_be_refused() {
        let (tracker, _) = tracker().await;
        tracker
            .obtain("clinic-a", "p-1", "treatment", "nurse-1", Acknowledgment::complete(), None)
            .await
            .unwrap();
        let err = tracker
            .refuse("clinic-a", "p-1", "treatment", "nurse-1", "no longer wants it")
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_record_starts_new_cycle() {
        let (tracker, _) = tracker().await;
        let refused = tracker
            .refuse("clinic-a", "p-1", "treatment", "nurse-1", "needs time")
            .await
            .unwrap();
        let obtained = tracker
            .obtain("clinic-a", "p-1", "treatment", "nurse-1", Acknowledgment::complete(), None)
            .await
            .unwrap();
        assert_ne!(refused.id, obtained.id);
        assert_eq!(tracker.records_for_patient("clinic-a", "p-1").await.unwrap().len(), 2);
        assert_eq!(tracker.patient_history("clinic-a", "p-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_template_versions() {
        let (tracker, _) = tracker().await;
        let v2 = tracker
            .register_template("clinic-a", "treatment", "Consent to treatment (2026)", true, "admin")
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        let required = tracker.required_templates("clinic-a").await.unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].id, v2.id);

        let err = tracker.request("clinic-a", "p-1", "unknown", "nurse-1").await.unwrap_err();
        assert!(matches!(err, ComplianceError::NotFound(_)));
    }
}
