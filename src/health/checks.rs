//! The five compliance checks.
//!
//! Each check is a function of current state and the time it runs at.
//! Tenant-scoped checks given no tenant cover every tenant with a ledger.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::access::AccessLogger;
use crate::config::HealthPolicy;
use crate::consent::ConsentTracker;
use crate::error::{ComplianceError, ComplianceResult};
use crate::external::{ClinicalDataStore, IdentityProvider, StaticIdentity};
use crate::health::types::{CheckOutcome, CheckStatus, CheckType};
use crate::isolation::IsolationMonitor;
use crate::ledger::{EventType, LedgerDraft, LedgerStore, VerificationResult};

const INTEGRITY_VIOLATION: &str = "integrity_violation";

#[derive(Clone)]
pub struct ComplianceChecks {
    pub(crate) ledger: LedgerStore,
    pub(crate) access: AccessLogger,
    pub(crate) monitor: IsolationMonitor,
    pub(crate) consent: ConsentTracker,
    pub(crate) clinical: Arc<dyn ClinicalDataStore>,
    pub(crate) policy: HealthPolicy,
}

impl ComplianceChecks {
    pub fn new(
        ledger: LedgerStore,
        access: AccessLogger,
        monitor: IsolationMonitor,
        consent: ConsentTracker,
        clinical: Arc<dyn ClinicalDataStore>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            ledger,
            access,
            monitor,
            consent,
            clinical,
            policy,
        }
    }

    pub async fn evaluate(
        &self,
        check: CheckType,
        tenant_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> ComplianceResult<CheckOutcome> {
        match check {
            CheckType::LedgerIntegrity => self.ledger_integrity(tenant_id).await,
            CheckType::IsolationCoverage => self.isolation_coverage(tenant_id, at).await,
            CheckType::ConsentCoverage => self.consent_coverage(tenant_id).await,
            CheckType::AccessCompleteness => self.access_completeness(tenant_id).await,
            CheckType::EncryptionCoverage => self.encryption_coverage().await,
        }
    }

    async fn scope(&self, tenant_id: Option<&str>) -> ComplianceResult<Vec<String>> {
        match tenant_id {
            Some(tenant_id) => Ok(vec![tenant_id.to_string()]),
            None => self.ledger.tenants().await,
        }
    }

    /// Any chain break fails the check and is itself recorded in that tenant's chain.
    async fn ledger_integrity(&self, tenant_id: Option<&str>) -> ComplianceResult<CheckOutcome> {
        let mut status = CheckStatus::Passed;
        let mut tenants = BTreeMap::new();

        for tenant in self.scope(tenant_id).await? {
            let result = self.ledger.verify_chain(&tenant, None, None).await?;
            if !result.is_valid {
                status = CheckStatus::Failed;
                let violation = ComplianceError::IntegrityViolation {
                    tenant_id: tenant.clone(),
                    sequence_no: result.first_break_sequence.unwrap_or_default(),
                };
                error!("{}: {}", violation, result.summary());
                self.record_violation(&tenant, &result).await?;
            }
            tenants.insert(
                tenant,
                json!({
                    "is_valid": result.is_valid,
                    "total_checked": result.total_checked,
                    "first_break_sequence": result.first_break_sequence,
                }),
            );
        }

        Ok(CheckOutcome::new(status, json!({ "tenants": tenants })))
    }

    /// One security event per distinct break; reruns over the same break add nothing.
    async fn record_violation(&self, tenant_id: &str, result: &VerificationResult) -> ComplianceResult<()> {
        let first_break = result.first_break_sequence.unwrap_or_default();
        let mut txn = self.ledger.begin(tenant_id).await?;
        let recorded: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ledger_entries
            WHERE tenant_id = ? AND event_type = ? AND action = ?
              AND CASE WHEN json_valid(new_value)
                  THEN json_extract(new_value, '$.first_break_sequence') END = ?
            "#,
        )
        .bind(tenant_id)
        .bind(EventType::SecurityEvent.as_str())
        .bind(INTEGRITY_VIOLATION)
        .bind(first_break)
        .fetch_one(txn.conn())
        .await?;
        if recorded > 0 {
            debug!("Break at {} in {} already recorded", first_break, tenant_id);
            return Ok(());
        }

        let system = StaticIdentity::system(tenant_id).current_actor()?;
        txn.append(
            LedgerDraft::new(EventType::SecurityEvent, "ledger", INTEGRITY_VIOLATION)
                .actor(system.actor_id)
                .new_value(json!({
                    "first_break_sequence": result.first_break_sequence,
                    "break_kind": result.break_kind,
                    "expected_hash": result.expected_hash,
                    "actual_hash": result.actual_hash,
                })),
        )
        .await?;
        txn.commit().await
    }

    async fn isolation_coverage(&self, tenant_id: Option<&str>, at: DateTime<Utc>) -> ComplianceResult<CheckOutcome> {
        let open = self.monitor.open_alerts(tenant_id).await?;
        let threshold = self.policy.alert_failed_after();
        let overdue: Vec<i64> = open.iter().filter(|a| a.age(at) > threshold).map(|a| a.id).collect();

        let status = if !overdue.is_empty() {
            CheckStatus::Failed
        } else if !open.is_empty() {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };
        Ok(CheckOutcome::new(
            status,
            json!({
                "open_alerts": open.iter().map(|a| a.id).collect::<Vec<_>>(),
                "overdue_alerts": overdue,
                "threshold_hours": self.policy.alert_failed_after_hours,
            }),
        ))
    }

    /// Share of active patients with every required consent obtained.
    async fn consent_coverage(&self, tenant_id: Option<&str>) -> ComplianceResult<CheckOutcome> {
        let mut total = 0u64;
        let mut covered = 0u64;
        for tenant in self.scope(tenant_id).await? {
            for patient in self.clinical.active_patients(&tenant).await? {
                total += 1;
                if self.consent.missing_required(&tenant, &patient).await?.is_empty() {
                    covered += 1;
                }
            }
        }

        let ratio = if total == 0 { 1.0 } else { covered as f64 / total as f64 };
        let status = if ratio < self.policy.consent_low_water {
            CheckStatus::Failed
        } else if ratio < self.policy.consent_target {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };
        Ok(CheckOutcome::new(
            status,
            json!({
                "active_patients": total,
                "fully_consented": covered,
                "ratio": ratio,
                "low_water": self.policy.consent_low_water,
                "target": self.policy.consent_target,
            }),
        ))
    }

    /// Every access entry has its record, and every sensitive modification has a recorded write access.
    async fn access_completeness(&self, tenant_id: Option<&str>) -> ComplianceResult<CheckOutcome> {
        let mut gaps = BTreeMap::new();
        for tenant in self.scope(tenant_id).await? {
            let unpaired = self.access.unpaired_ledger_entries(&tenant).await?;
            let unaccounted = self
                .access
                .unaccounted_modifications(&tenant, &self.policy.sensitive_resource_types)
                .await?;
            if !unpaired.is_empty() || !unaccounted.is_empty() {
                gaps.insert(
                    tenant,
                    json!({
                        "unpaired_access_entries": unpaired,
                        "unaccounted_modifications": unaccounted,
                    }),
                );
            }
        }

        let status = if gaps.is_empty() {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        };
        Ok(CheckOutcome::new(status, json!({ "gaps": gaps })))
    }

    async fn encryption_coverage(&self) -> ComplianceResult<CheckOutcome> {
        let mut unencrypted = BTreeMap::new();
        for (resource_type, fields) in &self.policy.sensitive_fields {
            let encrypted = self.clinical.encrypted_fields(resource_type).await?;
            let missing: Vec<&String> = fields.iter().filter(|f| !encrypted.contains(*f)).collect();
            if !missing.is_empty() {
                unencrypted.insert(resource_type.clone(), missing);
            }
        }

        let status = if unencrypted.is_empty() {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        };
        Ok(CheckOutcome::new(status, json!({ "unencrypted_fields": unencrypted })))
    }
}
