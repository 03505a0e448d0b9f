//! Health-Check Scheduler
//!
//! Runs checks, times them and appends every verdict to the history table.
//! A check never errors out to its caller: internal failures become a
//! `failed` result carrying the error text.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::Row;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::{encode_time, now, Database};
use crate::error::ComplianceResult;
use crate::health::checks::ComplianceChecks;
use crate::health::types::{CheckOutcome, CheckStatus, CheckType, HealthCheckResult};

#[derive(Clone)]
pub struct HealthCheckScheduler {
    checks: ComplianceChecks,
    db: Database,
}

impl HealthCheckScheduler {
    pub fn new(checks: ComplianceChecks) -> Self {
        let db = checks.ledger.database().clone();
        Self { checks, db }
    }

    /// Run one check now.
    pub async fn run(&self, check: CheckType, tenant_id: Option<&str>) -> HealthCheckResult {
        self.run_at(check, tenant_id, now()).await
    }

    /// Run one check as of `at`; only the alert-age rule depends on the clock.
    pub async fn run_at(&self, check: CheckType, tenant_id: Option<&str>, at: DateTime<Utc>) -> HealthCheckResult {
        let tenant_id = if check.is_global() { None } else { tenant_id };
        let started = Instant::now();
        let outcome = match self.checks.evaluate(check, tenant_id, at).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Health check {} crashed: {}", check, e);
                CheckOutcome::new(CheckStatus::Failed, json!({ "error": e.to_string() }))
            }
        };

        let mut result = HealthCheckResult {
            id: None,
            check_type: check,
            tenant_id: tenant_id.map(str::to_string),
            status: outcome.status,
            details: outcome.details,
            duration_ms: started.elapsed().as_millis() as i64,
            timestamp: at,
        };

        match self.persist(&result).await {
            Ok(id) => result.id = Some(id),
            Err(e) => error!("Failed to persist {} result: {}", check, e),
        }

        match result.status {
            CheckStatus::Passed => info!(
                "Health check {} for {} passed in {}ms",
                check,
                tenant_id.unwrap_or("all tenants"),
                result.duration_ms
            ),
            CheckStatus::Warning => warn!(
                "Health check {} for {}: warning {}",
                check,
                tenant_id.unwrap_or("all tenants"),
                result.details
            ),
            CheckStatus::Failed => error!(
                "Health check {} for {}: FAILED {}",
                check,
                tenant_id.unwrap_or("all tenants"),
                result.details
            ),
        }
        result
    }

    /// Every check type for one tenant; global checks run unscoped.
    pub async fn run_all(&self, tenant_id: Option<&str>) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(CheckType::ALL.len());
        for check in CheckType::ALL {
            results.push(self.run(check, tenant_id).await);
        }
        results
    }

    /// One sweep: tenant-scoped checks per ledger tenant, global checks once.
    pub async fn run_sweep(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::new();
        let tenants = match self.checks.ledger.tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("Could not list tenants for health sweep: {}", e);
                Vec::new()
            }
        };

        for check in CheckType::ALL {
            if check.is_global() || tenants.is_empty() {
                results.push(self.run(check, None).await);
                continue;
            }
            for tenant in &tenants {
                results.push(self.run(check, Some(tenant)).await);
            }
        }
        results
    }

    /// Background sweep on a fixed interval.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let results = self.run_sweep().await;
                let failed = results.iter().filter(|r| r.status == CheckStatus::Failed).count();
                info!("Health sweep finished: {} checks, {} failed", results.len(), failed);
            }
        })
    }

    async fn persist(&self, result: &HealthCheckResult) -> ComplianceResult<i64> {
        self.db
            .bounded(async {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO health_check_results (check_type, tenant_id, status, details, duration_ms, timestamp)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(result.check_type.as_str())
                .bind(&result.tenant_id)
                .bind(result.status.as_str())
                .bind(result.details.to_string())
                .bind(result.duration_ms)
                .bind(encode_time(&result.timestamp))
                .execute(self.db.pool())
                .await?;
                Ok(inserted.last_insert_rowid())
            })
            .await
    }

    pub async fn latest(&self, check: CheckType, tenant_id: Option<&str>) -> ComplianceResult<Option<HealthCheckResult>> {
        latest_result(&self.db, check, tenant_id, None).await
    }

    /// Latest result stamped strictly before `as_of`.
    pub async fn latest_as_of(
        &self,
        check: CheckType,
        tenant_id: Option<&str>,
        as_of: &DateTime<Utc>,
    ) -> ComplianceResult<Option<HealthCheckResult>> {
        latest_result(&self.db, check, tenant_id, Some(as_of)).await
    }

    pub async fn history(&self, check: CheckType, tenant_id: Option<&str>, limit: i64) -> ComplianceResult<Vec<HealthCheckResult>> {
        self.db
            .bounded(async {
                let rows = sqlx::query(
                    r#"
                    SELECT * FROM health_check_results
                    WHERE check_type = ? AND tenant_id IS ?
                    ORDER BY timestamp DESC, id DESC LIMIT ?
                    "#,
                )
                .bind(check.as_str())
                .bind(tenant_id)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                rows.iter().map(HealthCheckResult::from_row).collect()
            })
            .await
    }
}

/// Latest verdict for exactly this scope. Global checks are always read unscoped.
pub(crate) async fn latest_result(
    db: &Database,
    check: CheckType,
    tenant_id: Option<&str>,
    as_of: Option<&DateTime<Utc>>,
) -> ComplianceResult<Option<HealthCheckResult>> {
    let scope = if check.is_global() { None } else { tenant_id };
    db.bounded(async {
        let row = sqlx::query(
            r#"
            SELECT * FROM health_check_results
            WHERE check_type = ?
              AND tenant_id IS ?
              AND (? IS NULL OR timestamp < ?)
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(check.as_str())
        .bind(scope)
        .bind(as_of.map(encode_time))
        .bind(as_of.map(encode_time))
        .fetch_optional(db.pool())
        .await?;

        let result = row.as_ref().map(HealthCheckResult::from_row).transpose()?;
        debug!(
            "Latest {} for {}: {:?}",
            check,
            tenant_id.unwrap_or("all tenants"),
            result.as_ref().map(|r| r.status)
        );
        Ok(result)
    })
    .await
}

/// Count of persisted results, for dashboards and tests.
pub async fn result_count(db: &Database) -> ComplianceResult<i64> {
    db.bounded(async {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM health_check_results")
            .fetch_one(db.pool())
            .await?;
        Ok(row.get("n"))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLogger;
    use crate::config::HealthPolicy;
    use crate::consent::ConsentTracker;
    use crate::external::InMemoryClinicalStore;
    use crate::isolation::IsolationMonitor;
    use crate::ledger::LedgerStore;
    use std::sync::Arc;

    async fn scheduler() -> HealthCheckScheduler {
        let ledger = LedgerStore::new(Database::new_in_memory().await.unwrap());
        let clinical = Arc::new(InMemoryClinicalStore::new());
        let monitor = IsolationMonitor::new(ledger.clone(), clinical.clone());
        let access = AccessLogger::new(ledger.clone(), Arc::new(monitor.clone()));
        let consent = ConsentTracker::new(ledger.clone());
        HealthCheckScheduler::new(ComplianceChecks::new(
            ledger,
            access,
            monitor,
            consent,
            clinical,
            HealthPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn test_every_run_is_persisted() {
        let scheduler = scheduler().await;
        let results = scheduler.run_all(Some("clinic-a")).await;
        assert_eq!(results.len(), CheckType::ALL.len());
        assert!(results.iter().all(|r| r.id.is_some()));
        assert_eq!(result_count(&scheduler.db).await.unwrap(), 5);

        let encryption = results
            .iter()
            .find(|r| r.check_type == CheckType::EncryptionCoverage)
            .unwrap();
        assert_eq!(encryption.tenant_id, None);
    }

    #[tokio::test]
    async fn test_latest_picks_newest_and_respects_as_of() {
        let scheduler = scheduler().await;
        let first = scheduler.run(CheckType::LedgerIntegrity, Some("clinic-a")).await;
        let second = scheduler
            .run_at(
                CheckType::LedgerIntegrity,
                Some("clinic-a"),
                first.timestamp + chrono::Duration::seconds(10),
            )
            .await;

        let latest = scheduler.latest(CheckType::LedgerIntegrity, Some("clinic-a")).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let pinned = scheduler
            .latest_as_of(CheckType::LedgerIntegrity, Some("clinic-a"), &second.timestamp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.id, first.id);

        // A result stamped exactly at the boundary is not yet visible.
        assert!(scheduler
            .latest_as_of(CheckType::LedgerIntegrity, Some("clinic-a"), &first.timestamp)
            .await
            .unwrap()
            .is_none());

        assert!(scheduler.latest(CheckType::ConsentCoverage, Some("clinic-a")).await.unwrap().is_none());
        assert_eq!(
            scheduler.history(CheckType::LedgerIntegrity, Some("clinic-a"), 10).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_store_failure_becomes_failed_result() {
        let scheduler = scheduler().await;
        sqlx::query("DROP TABLE isolation_alerts")
            .execute(scheduler.db.pool())
            .await
            .unwrap();

        let result = scheduler.run(CheckType::IsolationCoverage, Some("clinic-a")).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(result.details["error"].as_str().is_some());
        assert!(result.id.is_some());
    }
}
