use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::decode_time;
use crate::error::{ComplianceError, ComplianceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    LedgerIntegrity,
    IsolationCoverage,
    ConsentCoverage,
    AccessCompleteness,
    EncryptionCoverage,
}

impl CheckType {
    pub const ALL: [CheckType; 5] = [
        CheckType::LedgerIntegrity,
        CheckType::IsolationCoverage,
        CheckType::ConsentCoverage,
        CheckType::AccessCompleteness,
        CheckType::EncryptionCoverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::LedgerIntegrity => "ledger_integrity",
            CheckType::IsolationCoverage => "isolation_coverage",
            CheckType::ConsentCoverage => "consent_coverage",
            CheckType::AccessCompleteness => "access_completeness",
            CheckType::EncryptionCoverage => "encryption_coverage",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Checks over schema metadata rather than one tenant's data.
    pub fn is_global(&self) -> bool {
        matches!(self, CheckType::EncryptionCoverage)
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passed => "passed",
            CheckStatus::Warning => "warning",
            CheckStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(CheckStatus::Passed),
            "warning" => Some(CheckStatus::Warning),
            "failed" => Some(CheckStatus::Failed),
            _ => None,
        }
    }
}

/// Verdict of one check before it is timed and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub details: Value,
}

impl CheckOutcome {
    pub fn new(status: CheckStatus, details: Value) -> Self {
        Self { status, details }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// `None` only if the result could not be persisted.
    pub id: Option<i64>,
    pub check_type: CheckType,
    pub tenant_id: Option<String>,
    pub status: CheckStatus,
    pub details: Value,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }

    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let raw_check: String = row.get("check_type");
        let check_type = CheckType::from_str(&raw_check)
            .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown check type: {}", raw_check)))?;
        let raw_status: String = row.get("status");
        let status = CheckStatus::from_str(&raw_status)
            .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown check status: {}", raw_status)))?;
        let details: String = row.get("details");
        let timestamp: String = row.get("timestamp");

        Ok(Self {
            id: Some(row.get("id")),
            check_type,
            tenant_id: row.get("tenant_id"),
            status,
            details: serde_json::from_str(&details)?,
            duration_ms: row.get("duration_ms"),
            timestamp: decode_time(&timestamp)?,
        })
    }
}
