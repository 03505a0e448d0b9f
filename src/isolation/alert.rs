use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{decode_optional_time, decode_time};
use crate::error::{ComplianceError, ComplianceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AlertStatus::Open),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// A cross-tenant access observed by the isolation monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationAlert {
    pub id: i64,
    /// Tenant whose actor performed the access.
    pub source_tenant_id: String,
    /// Tenant that owns the resource.
    pub owner_tenant_id: String,
    pub access_record_id: i64,
    pub actor_id: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub detail: String,
    pub status: AlertStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl IsolationAlert {
    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Open
    }

    pub fn age(&self, at: DateTime<Utc>) -> Duration {
        at - self.detected_at
    }

    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let raw_status: String = row.get("status");
        let status = AlertStatus::from_str(&raw_status)
            .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown alert status: {}", raw_status)))?;
        let detected_at: String = row.get("detected_at");

        Ok(Self {
            id: row.get("id"),
            source_tenant_id: row.get("source_tenant_id"),
            owner_tenant_id: row.get("owner_tenant_id"),
            access_record_id: row.get("access_record_id"),
            actor_id: row.get("actor_id"),
            resource_type: row.get("resource_type"),
            resource_id: row.get("resource_id"),
            detected_at: decode_time(&detected_at)?,
            detail: row.get("detail"),
            status,
            resolved_by: row.get("resolved_by"),
            resolved_at: decode_optional_time(row.get("resolved_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_status_names() {
        assert_eq!(AlertStatus::from_str("open"), Some(AlertStatus::Open));
        assert_eq!(AlertStatus::Resolved.as_str(), "resolved");
        assert_eq!(AlertStatus::from_str("dismissed"), None);
    }
}
