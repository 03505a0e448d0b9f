//! Certification Report
//!
//! A point-in-time compliance snapshot for one tenant over one period. The
//! read boundary is the explicit `as_of` argument, never the wall clock,
//! so the same inputs over an unchanged store give byte-identical output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::access::AccessLogger;
use crate::consent::ConsentTracker;
use crate::error::{ComplianceError, ComplianceResult};
use crate::external::{ClinicalDataStore, Period};
use crate::health::scheduler::latest_result;
use crate::health::{CheckStatus, CheckType};
use crate::isolation::IsolationMonitor;
use crate::ledger::{merkle_root, LedgerFilter, LedgerStore, VerificationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    #[serde(rename = "COMPLIANT")]
    Compliant,
    #[serde(rename = "NON-COMPLIANT")]
    NonCompliant,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Compliant => "COMPLIANT",
            OverallStatus::NonCompliant => "NON-COMPLIANT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub check_type: CheckType,
    /// `None` when the check never ran before the boundary.
    pub status: Option<CheckStatus>,
    pub result_id: Option<i64>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub access_records: i64,
    pub isolation_alerts: i64,
    pub consent_records: i64,
    pub ledger_entries: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvidence {
    pub first_sequence: Option<i64>,
    pub last_sequence: Option<i64>,
    pub verification: VerificationResult,
    pub merkle_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificationReport {
    pub tenant_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
    pub health_checks: Vec<CheckSummary>,
    pub counts: ActivityCounts,
    pub clinical_counts: BTreeMap<String, u64>,
    pub chain: ChainEvidence,
    pub findings: Vec<String>,
    pub overall_status: OverallStatus,
}

impl CertificationReport {
    /// Serialized form handed to auditors.
    pub fn to_canonical_bytes(&self) -> ComplianceResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Clone)]
pub struct ReportGenerator {
    pub(crate) ledger: LedgerStore,
    pub(crate) access: AccessLogger,
    pub(crate) monitor: IsolationMonitor,
    pub(crate) consent: ConsentTracker,
    pub(crate) clinical: Arc<dyn ClinicalDataStore>,
}

impl ReportGenerator {
    pub fn new(
        ledger: LedgerStore,
        access: AccessLogger,
        monitor: IsolationMonitor,
        consent: ConsentTracker,
        clinical: Arc<dyn ClinicalDataStore>,
    ) -> Self {
        Self {
            ledger,
            access,
            monitor,
            consent,
            clinical,
        }
    }

    /// Read-only: nothing is written while the report is assembled.
    pub async fn generate_certification_report(
        &self,
        tenant_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> ComplianceResult<CertificationReport> {
        let period = Period::new(period_start, period_end)?;
        if tenant_id.trim().is_empty() {
            return Err(ComplianceError::invalid_input("tenant_id must not be empty"));
        }
        // Nothing after the boundary is visible.
        let window_end = period.end.min(as_of);
        let window_start = period.start.min(window_end);

        let mut findings = Vec::new();
        let mut all_passed = true;

        let mut health_checks = Vec::with_capacity(CheckType::ALL.len());
        for check in CheckType::ALL {
            let latest = latest_result(self.ledger.database(), check, Some(tenant_id), Some(&as_of)).await?;
            let status = latest.as_ref().map(|r| r.status);
            match status {
                Some(CheckStatus::Passed) => {}
                Some(other) => {
                    all_passed = false;
                    findings.push(format!("{}: latest result is {}", check, other.as_str()));
                }
                None => {
                    all_passed = false;
                    findings.push(format!("{}: no result recorded", check));
                }
            }
            health_checks.push(CheckSummary {
                check_type: check,
                status,
                result_id: latest.as_ref().and_then(|r| r.id),
                checked_at: latest.as_ref().map(|r| r.timestamp),
            });
        }

        let chain = self.chain_evidence(tenant_id, &window_start, &window_end).await?;
        if !chain.verification.is_valid {
            findings.push(format!(
                "ledger chain broken at sequence {}",
                chain.verification.first_break_sequence.unwrap_or_default()
            ));
        }

        let counts = ActivityCounts {
            access_records: self.access.count_between(tenant_id, &window_start, &window_end).await?,
            isolation_alerts: self.monitor.count_between(tenant_id, &window_start, &window_end).await?,
            consent_records: self.consent.count_between(tenant_id, &window_start, &window_end).await?,
            ledger_entries: match (chain.first_sequence, chain.last_sequence) {
                (Some(first), Some(last)) => last - first + 1,
                _ => 0,
            },
        };
        let clinical_counts = self.clinical.counts(tenant_id, &period).await?;

        let overall_status = if all_passed && chain.verification.is_valid {
            OverallStatus::Compliant
        } else {
            OverallStatus::NonCompliant
        };
        info!(
            "Certification report for tenant {} [{} .. {}) as of {}: {}",
            tenant_id,
            period.start,
            period.end,
            as_of,
            overall_status.as_str()
        );

        Ok(CertificationReport {
            tenant_id: tenant_id.to_string(),
            period_start: period.start,
            period_end: period.end,
            as_of,
            health_checks,
            counts,
            clinical_counts,
            chain,
            findings,
            overall_status,
        })
    }

    async fn chain_evidence(
        &self,
        tenant_id: &str,
        since: &DateTime<Utc>,
        until: &DateTime<Utc>,
    ) -> ComplianceResult<ChainEvidence> {
        let head = self.ledger.head(tenant_id).await?.map(|h| h.sequence_no).unwrap_or(0);
        let Some((first, last)) = self.ledger.sequence_bounds(tenant_id, since, until, head).await? else {
            return Ok(ChainEvidence {
                first_sequence: None,
                last_sequence: None,
                verification: VerificationResult::empty(tenant_id),
                merkle_root: None,
            });
        };

        let verification = self.ledger.verify_chain(tenant_id, Some(first), Some(last)).await?;
        // No root over a broken range; its rows may not even decode.
        let root = if verification.is_valid {
            let entries = self
                .ledger
                .read(
                    tenant_id,
                    &LedgerFilter {
                        max_sequence: Some(last),
                        ..LedgerFilter::default()
                    }
                    .between(*since, *until),
                )
                .await?;
            merkle_root(&entries)
        } else {
            None
        };

        Ok(ChainEvidence {
            first_sequence: Some(first),
            last_sequence: Some(last),
            verification,
            merkle_root: root,
        })
    }
}
