//! Isolation Monitor
//!
//! Deterministic tenant-boundary check over every recorded access. The
//! owning tenant comes from the metadata the caller supplied with the
//! access, falling back to the clinical store. Every mismatch raises a new
//! alert; alerts are never merged or deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::{AccessInspector, AccessRecord};
use crate::database::{encode_time, now};
use crate::error::{ComplianceError, ComplianceResult};
use crate::external::ClinicalDataStore;
use crate::isolation::alert::{AlertStatus, IsolationAlert};
use crate::ledger::{EventType, LedgerDraft, LedgerStore};

#[derive(Clone)]
pub struct IsolationMonitor {
    ledger: LedgerStore,
    clinical: Arc<dyn ClinicalDataStore>,
}

impl IsolationMonitor {
    pub fn new(ledger: LedgerStore, clinical: Arc<dyn ClinicalDataStore>) -> Self {
        Self { ledger, clinical }
    }

    /// Owning tenant of the accessed resource, if it can be determined.
    pub async fn owning_tenant(&self, record: &AccessRecord) -> ComplianceResult<Option<String>> {
        if let Some(owner) = &record.resource_owner_tenant {
            return Ok(Some(owner.clone()));
        }
        match &record.resource_id {
            Some(resource_id) => {
                self.clinical
                    .resource_owner_tenant(&record.resource_type, resource_id)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn raise(&self, record: &AccessRecord, owner_tenant_id: String) -> ComplianceResult<IsolationAlert> {
        let detected_at = now();
        let detail = format!(
            "actor {} in tenant {} performed {} on {}/{} owned by tenant {}",
            record.actor_id,
            record.tenant_id,
            record.action_type.as_str(),
            record.resource_type,
            record.resource_id.as_deref().unwrap_or("-"),
            owner_tenant_id
        );

        let mut txn = self.ledger.begin(&record.tenant_id).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO isolation_alerts
            (source_tenant_id, owner_tenant_id, access_record_id, actor_id, resource_type, resource_id,
             detected_at, detail, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&owner_tenant_id)
        .bind(record.id)
        .bind(&record.actor_id)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(encode_time(&detected_at))
        .bind(&detail)
        .bind(AlertStatus::Open.as_str())
        .execute(txn.conn())
        .await?;
        let alert_id = result.last_insert_rowid();

        txn.append(
            LedgerDraft::new(EventType::SecurityEvent, "isolation_alert", "isolation_violation")
                .actor(&record.actor_id)
                .resource_id(alert_id.to_string())
                .new_value(json!({
                    "access_record_id": record.id,
                    "owner_tenant_id": owner_tenant_id,
                    "resource_type": record.resource_type,
                    "resource_id": record.resource_id,
                })),
        )
        .await?;
        txn.commit().await?;

        warn!("Isolation alert {}: {}", alert_id, detail);
        Ok(IsolationAlert {
            id: alert_id,
            source_tenant_id: record.tenant_id.clone(),
            owner_tenant_id,
            access_record_id: record.id,
            actor_id: record.actor_id.clone(),
            resource_type: record.resource_type.clone(),
            resource_id: record.resource_id.clone(),
            detected_at,
            detail,
            status: AlertStatus::Open,
            resolved_by: None,
            resolved_at: None,
        })
    }

    /// Close an open alert; a second call fails with `AlreadyResolved`.
    pub async fn resolve(&self, alert_id: i64, resolved_by: &str) -> ComplianceResult<IsolationAlert> {
        if resolved_by.trim().is_empty() {
            return Err(ComplianceError::invalid_input("resolved_by must not be empty"));
        }
        let alert = self.get(alert_id).await?;
        if !alert.is_open() {
            return Err(ComplianceError::AlreadyResolved(alert_id));
        }

        let resolved_at = now();
        let mut txn = self.ledger.begin(&alert.source_tenant_id).await?;
        let updated = sqlx::query(
            r#"
            UPDATE isolation_alerts SET status = ?, resolved_by = ?, resolved_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(AlertStatus::Resolved.as_str())
        .bind(resolved_by)
        .bind(encode_time(&resolved_at))
        .bind(alert_id)
        .bind(AlertStatus::Open.as_str())
        .execute(txn.conn())
        .await?
        .rows_affected();
        if updated != 1 {
            // Lost a race with another resolver.
            return Err(ComplianceError::AlreadyResolved(alert_id));
        }

        txn.append(
            LedgerDraft::new(EventType::UserAction, "isolation_alert", "resolve")
                .actor(resolved_by)
                .resource_id(alert_id.to_string())
                .previous_value(json!({ "status": AlertStatus::Open.as_str() }))
                .new_value(json!({ "status": AlertStatus::Resolved.as_str() })),
        )
        .await?;
        txn.commit().await?;

        info!("Isolation alert {} resolved by {}", alert_id, resolved_by);
        Ok(IsolationAlert {
            status: AlertStatus::Resolved,
            resolved_by: Some(resolved_by.to_string()),
            resolved_at: Some(resolved_at),
            ..alert
        })
    }

    /// Like `resolve`, but an already-resolved alert is returned as-is.
    pub async fn resolve_idempotent(&self, alert_id: i64, resolved_by: &str) -> ComplianceResult<IsolationAlert> {
        match self.resolve(alert_id, resolved_by).await {
            Err(ComplianceError::AlreadyResolved(_)) => {
                debug!("Alert {} was already resolved", alert_id);
                self.get(alert_id).await
            }
            other => other,
        }
    }

    pub async fn get(&self, alert_id: i64) -> ComplianceResult<IsolationAlert> {
        let db = self.ledger.database();
        db.bounded(async {
            let row = sqlx::query("SELECT * FROM isolation_alerts WHERE id = ?")
                .bind(alert_id)
                .fetch_optional(db.pool())
                .await?
                .ok_or_else(|| ComplianceError::not_found(format!("isolation alert {}", alert_id)))?;
            IsolationAlert::from_row(&row)
        })
        .await
    }

    /// Open alerts, oldest first; all tenants when `tenant_id` is `None`.
    pub async fn open_alerts(&self, tenant_id: Option<&str>) -> ComplianceResult<Vec<IsolationAlert>> {
        let db = self.ledger.database();
        db.bounded(async {
            let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM isolation_alerts WHERE status = ");
            query.push_bind(AlertStatus::Open.as_str());
            if let Some(tenant_id) = tenant_id {
                query.push(" AND source_tenant_id = ").push_bind(tenant_id.to_string());
            }
            query.push(" ORDER BY detected_at ASC, id ASC");
            let rows = query.build().fetch_all(db.pool()).await?;
            rows.iter().map(IsolationAlert::from_row).collect()
        })
        .await
    }

    /// Alerts raised for a source tenant within `[since, until)`.
    pub async fn alerts_between(
        &self,
        tenant_id: &str,
        since: &DateTime<Utc>,
        until: &DateTime<Utc>,
    ) -> ComplianceResult<Vec<IsolationAlert>> {
        let db = self.ledger.database();
        db.bounded(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM isolation_alerts
                WHERE source_tenant_id = ? AND detected_at >= ? AND detected_at < ?
                ORDER BY id ASC
                "#,
            )
            .bind(tenant_id)
            .bind(encode_time(since))
            .bind(encode_time(until))
            .fetch_all(db.pool())
            .await?;
            rows.iter().map(IsolationAlert::from_row).collect()
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
                r#"
                SELECT COUNT(*) AS n FROM isolation_alerts
                WHERE source_tenant_id = ? AND detected_at >= ? AND detected_at < ?
                "#,
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

#[async_trait]
impl AccessInspector for IsolationMonitor {
    async fn inspect(&self, record: &AccessRecord) -> ComplianceResult<Option<IsolationAlert>> {
        // An access that cannot be attributed is reported, never passed.
        let Some(owner) = self.owning_tenant(record).await? else {
            return Err(ComplianceError::not_found(format!(
                "owning tenant of {}/{}",
                record.resource_type,
                record.resource_id.as_deref().unwrap_or("-")
            )));
        };
        if owner == record.tenant_id {
            return Ok(None);
        }
        self.raise(record, owner).await.map(Some)
    }
}
