//! Access Logger
//!
//! Records every access to a sensitive resource as one `AccessRecord` plus
//! one `data_access` ledger entry, committed in a single transaction, then
//! hands the record to the injected inspector before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::record::{AccessRecord, AccessRequest};
use crate::database::{encode_time, now};
use crate::error::{ComplianceError, ComplianceResult};
use crate::isolation::IsolationAlert;
use crate::ledger::{EventType, LedgerDraft, LedgerStore};

/// Boundary check run synchronously on every recorded access.
#[async_trait]
pub trait AccessInspector: Send + Sync {
    async fn inspect(&self, record: &AccessRecord) -> ComplianceResult<Option<IsolationAlert>>;
}

/// Inspector that never raises; for deployments that wire alerting elsewhere.
pub struct NoopInspector;

#[async_trait]
impl AccessInspector for NoopInspector {
    async fn inspect(&self, _record: &AccessRecord) -> ComplianceResult<Option<IsolationAlert>> {
        Ok(None)
    }
}

/// Read filters; time bounds are `[since, until)` on `created_at`.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AccessFilter {
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }
}

#[derive(Clone)]
pub struct AccessLogger {
    ledger: LedgerStore,
    inspector: Arc<dyn AccessInspector>,
}

impl AccessLogger {
    pub fn new(ledger: LedgerStore, inspector: Arc<dyn AccessInspector>) -> Self {
        Self { ledger, inspector }
    }

    /// Record one access; the record and its ledger entry commit together or not at all.
    pub async fn record_access(&self, request: AccessRequest) -> ComplianceResult<AccessRecord> {
        request.validate()?;

        let mut txn = self.ledger.begin(&request.tenant_id).await?;

        if let Some(key) = request.idempotency_key {
            if let Some(existing) = find_by_idempotency_key(txn.conn(), key).await? {
                if existing.tenant_id != request.tenant_id {
                    return Err(ComplianceError::invalid_input(format!(
                        "idempotency key {} belongs to another tenant",
                        key
                    )));
                }
                info!(
                    "Access retry with key {} matched record {} (seq {})",
                    key, existing.id, existing.ledger_sequence_no
                );
                return Ok(existing);
            }
        }

        let mut draft = LedgerDraft::new(EventType::DataAccess, &request.resource_type, request.action_type.as_str())
            .actor(&request.actor_id)
            .new_value(json!({
                "fields_accessed": request.fields_accessed,
                "reason": request.reason,
                "reason_category": request.reason_category.as_str(),
            }));
        if let Some(resource_id) = &request.resource_id {
            draft = draft.resource_id(resource_id);
        }
        let entry = txn.append(draft).await?;

        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO access_records
            (tenant_id, ledger_sequence_no, resource_type, resource_id, actor_id, action_type,
             fields_accessed, access_reason, reason_category, resource_owner_tenant, idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.tenant_id)
        .bind(entry.sequence_no)
        .bind(&request.resource_type)
        .bind(&request.resource_id)
        .bind(&request.actor_id)
        .bind(request.action_type.as_str())
        .bind(serde_json::to_string(&request.fields_accessed)?)
        .bind(&request.reason)
        .bind(request.reason_category.as_str())
        .bind(&request.resource_owner_tenant)
        .bind(request.idempotency_key.map(|k| k.to_string()))
        .bind(encode_time(&created_at))
        .execute(txn.conn())
        .await?;

        txn.commit().await?;

        let record = AccessRecord {
            id: result.last_insert_rowid(),
            tenant_id: request.tenant_id,
            ledger_sequence_no: entry.sequence_no,
            resource_type: request.resource_type,
            resource_id: request.resource_id,
            actor_id: request.actor_id,
            action_type: request.action_type,
            fields_accessed: request.fields_accessed,
            access_reason: request.reason,
            reason_category: request.reason_category,
            resource_owner_tenant: request.resource_owner_tenant,
            idempotency_key: request.idempotency_key,
            created_at,
        };
        info!(
            "Recorded {} access by {} to {}/{} in tenant {} (seq {})",
            record.action_type.as_str(),
            record.actor_id,
            record.resource_type,
            record.resource_id.as_deref().unwrap_or("-"),
            record.tenant_id,
            record.ledger_sequence_no
        );

        self.run_inspection(&record).await;
        Ok(record)
    }

    /// Inspection failures are reported, never rolled back into the access.
    async fn run_inspection(&self, record: &AccessRecord) {
        match self.inspector.inspect(record).await {
            Ok(Some(alert)) => {
                warn!("Access record {} raised isolation alert {}", record.id, alert.id);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Isolation inspection failed for access record {}: {}", record.id, e);
                let draft = LedgerDraft::new(EventType::SecurityEvent, "access_record", "isolation_monitor_failure")
                    .resource_id(record.id.to_string())
                    .new_value(json!({
                        "ledger_sequence_no": record.ledger_sequence_no,
                        "error": e.to_string(),
                    }));
                if let Err(report_err) = self.ledger.append(&record.tenant_id, draft).await {
                    error!(
                        "Failed to record monitor failure for access record {}: {}",
                        record.id, report_err
                    );
                }
            }
        }
    }

    pub async fn get(&self, id: i64) -> ComplianceResult<AccessRecord> {
        let db = self.ledger.database();
        db.bounded(async {
            let row = sqlx::query("SELECT * FROM access_records WHERE id = ?")
                .bind(id)
                .fetch_optional(db.pool())
                .await?
                .ok_or_else(|| ComplianceError::not_found(format!("access record {}", id)))?;
            AccessRecord::from_row(&row)
        })
        .await
    }

    pub async fn list(&self, tenant_id: &str, filter: &AccessFilter) -> ComplianceResult<Vec<AccessRecord>> {
        let db = self.ledger.database();
        db.bounded(async {
            let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM access_records WHERE tenant_id = ");
            query.push_bind(tenant_id.to_string());
            if let Some(actor_id) = &filter.actor_id {
                query.push(" AND actor_id = ").push_bind(actor_id.clone());
            }
            if let Some(resource_type) = &filter.resource_type {
                query.push(" AND resource_type = ").push_bind(resource_type.clone());
            }
            if let Some(resource_id) = &filter.resource_id {
                query.push(" AND resource_id = ").push_bind(resource_id.clone());
            }
            if let Some(since) = &filter.since {
                query.push(" AND created_at >= ").push_bind(encode_time(since));
            }
            if let Some(until) = &filter.until {
                query.push(" AND created_at < ").push_bind(encode_time(until));
            }
            query.push(" ORDER BY id ASC");

            let rows = query.build().fetch_all(db.pool()).await?;
            debug!("Loaded {} access records for tenant {}", rows.len(), tenant_id);
            rows.iter().map(AccessRecord::from_row).collect()
        })
        .await
    }

    pub async fn count_between(
        &self,
        tenant_id: &str,
        since: &DateTime<Utc>,
        until: &DateTime<Utc>,
    ) -> ComplianceResult<i64> {
        let db = self.ledger.database();
        db.bounded(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n FROM access_records WHERE tenant_id = ? AND created_at >= ? AND created_at < ?",
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

    /// `data_access` ledger entries with no access record behind them.
    pub async fn unpaired_ledger_entries(&self, tenant_id: &str) -> ComplianceResult<Vec<i64>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query(
                r#"
                SELECT l.sequence_no FROM ledger_entries l
                LEFT JOIN access_records a
                  ON a.tenant_id = l.tenant_id AND a.ledger_sequence_no = l.sequence_no
                WHERE l.tenant_id = ? AND l.event_type = ? AND a.id IS NULL
                ORDER BY l.sequence_no
                "#,
            )
            .bind(tenant_id)
            .bind(EventType::DataAccess.as_str())
            .fetch_all(db.pool())
            .await?;
            Ok(rows.iter().map(|r| r.get::<i64, _>("sequence_no")).collect())
        })
        .await
    }

    /// `data_modification` entries on the given resource types with no write access recorded for that resource.
    pub async fn unaccounted_modifications(
        &self,
        tenant_id: &str,
        resource_types: &[String],
    ) -> ComplianceResult<Vec<i64>> {
        if resource_types.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.ledger.database();
        db.bounded(async {
            let mut query = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT l.sequence_no FROM ledger_entries l
                WHERE l.tenant_id = "#,
            );
            query.push_bind(tenant_id.to_string());
            query.push(" AND l.event_type = ").push_bind(EventType::DataModification.as_str());
            query.push(" AND l.resource_type IN (");
            let mut separated = query.separated(", ");
            for resource_type in resource_types {
                separated.push_bind(resource_type.clone());
            }
            separated.push_unseparated(")");
            query.push(
                r#"
                AND NOT EXISTS (
                    SELECT 1 FROM access_records a
                    WHERE a.tenant_id = l.tenant_id
                      AND a.resource_type = l.resource_type
                      AND a.resource_id IS l.resource_id
                      AND a.action_type IN ('modify', 'delete')
                )
                ORDER BY l.sequence_no
                "#,
            );

            let rows = query.build().fetch_all(db.pool()).await?;
            Ok(rows.iter().map(|r| r.get::<i64, _>("sequence_no")).collect())
        })
        .await
    }
}

async fn find_by_idempotency_key(conn: &mut SqliteConnection, key: Uuid) -> ComplianceResult<Option<AccessRecord>> {
    let row = sqlx::query("SELECT * FROM access_records WHERE idempotency_key = ?")
        .bind(key.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(AccessRecord::from_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::record::{AccessAction, ReasonCategory};
    use crate::database::Database;
    use crate::ledger::LedgerFilter;

    struct FailingInspector;

    #[async_trait]
    impl AccessInspector for FailingInspector {
        async fn inspect(&self, _record: &AccessRecord) -> ComplianceResult<Option<IsolationAlert>> {
            Err(ComplianceError::StoreUnavailable("clinical store offline".to_string()))
        }
    }

    async fn logger(inspector: Arc<dyn AccessInspector>) -> (AccessLogger, LedgerStore) {
        let ledger = LedgerStore::new(Database::new_in_memory().await.unwrap());
        (AccessLogger::new(ledger.clone(), inspector), ledger)
    }

    fn request() -> AccessRequest {
        AccessRequest::new("dr-a", "clinic-a", "patient", Some("p-1".to_string()), AccessAction::View)
            .fields(["name", "allergies"])
            .reason("scheduled consultation", ReasonCategory::Care)
    }

    #[tokio::test]
    async fn test_record_is_paired_with_ledger_entry() {
        let (logger, ledger) = logger(Arc::new(NoopInspector)).await;
        let record = logger.record_access(request()).await.unwrap();

        let entries = ledger.read("clinic-a", &LedgerFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, EventType::DataAccess);
        assert_eq!(entries[0].sequence_no, record.ledger_sequence_no);
        assert_eq!(logger.get(record.id).await.unwrap(), record);
        assert!(logger.unpaired_ledger_entries("clinic-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_reason_writes_nothing() {
        let (logger, ledger) = logger(Arc::new(NoopInspector)).await;
        let err = logger
            .record_access(request().reason("", ReasonCategory::Care))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(ledger.head("clinic-a").await.unwrap().is_none());
        assert!(logger.list("clinic-a", &AccessFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_retry_returns_stored_record() {
        let (logger, ledger) = logger(Arc::new(NoopInspector)).await;
        let key = Uuid::new_v4();
        let first = logger.record_access(request().idempotency_key(key)).await.unwrap();
        let retry = logger.record_access(request().idempotency_key(key)).await.unwrap();

        assert_eq!(first, retry);
        assert_eq!(ledger.count("clinic-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_monitor_failure_keeps_access_and_reports() {
        let (logger, ledger) = logger(Arc::new(FailingInspector)).await;
        let record = logger.record_access(request()).await.unwrap();
        assert_eq!(record.ledger_sequence_no, 1);

        let security = ledger
            .read("clinic-a", &LedgerFilter::default().event_type(EventType::SecurityEvent))
            .await
            .unwrap();
        assert_eq!(security.len(), 1);
        assert_eq!(security[0].action, "isolation_monitor_failure");
        assert!(ledger.verify_chain("clinic-a", None, None).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_unaccounted_modifications() {
        let (logger, ledger) = logger(Arc::new(NoopInspector)).await;
        let sensitive = vec!["patient".to_string()];
        ledger
            .append(
                "clinic-a",
                LedgerDraft::new(EventType::DataModification, "patient", "update").resource_id("p-1"),
            )
            .await
            .unwrap();
        assert_eq!(
            logger.unaccounted_modifications("clinic-a", &sensitive).await.unwrap(),
            vec![1]
        );

        let write = AccessRequest::new("dr-a", "clinic-a", "patient", Some("p-1".to_string()), AccessAction::Modify)
            .reason("allergy update", ReasonCategory::Care);
        logger.record_access(write).await.unwrap();
        assert!(logger.unaccounted_modifications("clinic-a", &sensitive).await.unwrap().is_empty());
    }
}
