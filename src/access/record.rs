//! Access Record
//!
//! Metadata about one access to a sensitive resource. Always paired 1:1
//! with a `data_access` ledger entry through `ledger_sequence_no`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::database::decode_time;
use crate::error::{ComplianceError, ComplianceResult, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    View,
    Decrypt,
    Export,
    Modify,
    Delete,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::View => "view",
            AccessAction::Decrypt => "decrypt",
            AccessAction::Export => "export",
            AccessAction::Modify => "modify",
            AccessAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "view" => Some(AccessAction::View),
            "decrypt" => Some(AccessAction::Decrypt),
            "export" => Some(AccessAction::Export),
            "modify" => Some(AccessAction::Modify),
            "delete" => Some(AccessAction::Delete),
            _ => None,
        }
    }

    /// Actions that change the resource rather than read it.
    pub fn is_write(&self) -> bool {
        matches!(self, AccessAction::Modify | AccessAction::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    Care,
    Administrative,
    Billing,
    Legal,
    Emergency,
    Support,
    Other,
}

impl ReasonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCategory::Care => "care",
            ReasonCategory::Administrative => "administrative",
            ReasonCategory::Billing => "billing",
            ReasonCategory::Legal => "legal",
            ReasonCategory::Emergency => "emergency",
            ReasonCategory::Support => "support",
            ReasonCategory::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "care" => Some(ReasonCategory::Care),
            "administrative" => Some(ReasonCategory::Administrative),
            "billing" => Some(ReasonCategory::Billing),
            "legal" => Some(ReasonCategory::Legal),
            "emergency" => Some(ReasonCategory::Emergency),
            "support" => Some(ReasonCategory::Support),
            "other" => Some(ReasonCategory::Other),
            _ => None,
        }
    }
}

/// What the application layer submits to `AccessLogger::record_access`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub actor_id: String,
    pub tenant_id: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action_type: AccessAction,
    pub fields_accessed: BTreeSet<String>,
    pub reason: String,
    pub reason_category: ReasonCategory,
    /// Owning tenant as known from the resource metadata the caller loaded.
    pub resource_owner_tenant: Option<String>,
    pub idempotency_key: Option<Uuid>,
}

impl AccessRequest {
    pub fn new(
        actor_id: impl Into<String>,
        tenant_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
        action_type: AccessAction,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: tenant_id.into(),
            resource_type: resource_type.into(),
            resource_id,
            action_type,
            fields_accessed: BTreeSet::new(),
            reason: String::new(),
            reason_category: ReasonCategory::Care,
            resource_owner_tenant: None,
            idempotency_key: None,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields_accessed = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn reason(mut self, reason: impl Into<String>, category: ReasonCategory) -> Self {
        self.reason = reason.into();
        self.reason_category = category;
        self
    }

    pub fn owned_by(mut self, tenant_id: impl Into<String>) -> Self {
        self.resource_owner_tenant = Some(tenant_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Reject the request before anything is written.
    pub fn validate(&self) -> ComplianceResult<()> {
        if self.reason.trim().is_empty() {
            return Err(ValidationError::MissingJustification.into());
        }
        if self.actor_id.trim().is_empty() {
            return Err(ComplianceError::invalid_input("actor_id must not be empty"));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(ComplianceError::invalid_input("tenant_id must not be empty"));
        }
        if self.resource_type.trim().is_empty() {
            return Err(ComplianceError::invalid_input("resource_type must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: i64,
    pub tenant_id: String,
    pub ledger_sequence_no: i64,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor_id: String,
    pub action_type: AccessAction,
    pub fields_accessed: BTreeSet<String>,
    pub access_reason: String,
    pub reason_category: ReasonCategory,
    pub resource_owner_tenant: Option<String>,
    pub idempotency_key: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AccessRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let raw_action: String = row.get("action_type");
        let action_type = AccessAction::from_str(&raw_action)
            .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown access action: {}", raw_action)))?;
        let raw_category: String = row.get("reason_category");
        let reason_category = ReasonCategory::from_str(&raw_category)
            .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown reason category: {}", raw_category)))?;
        let fields: String = row.get("fields_accessed");
        let idempotency_key: Option<String> = row.get("idempotency_key");
        let idempotency_key = idempotency_key
            .map(|k| Uuid::parse_str(&k))
            .transpose()
            .map_err(|e| ComplianceError::DatabaseError(format!("Invalid idempotency key: {}", e)))?;
        let created_at: String = row.get("created_at");

        Ok(Self {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            ledger_sequence_no: row.get("ledger_sequence_no"),
            resource_type: row.get("resource_type"),
            resource_id: row.get("resource_id"),
            actor_id: row.get("actor_id"),
            action_type,
            fields_accessed: serde_json::from_str(&fields)?,
            access_reason: row.get("access_reason"),
            reason_category,
            resource_owner_tenant: row.get("resource_owner_tenant"),
            idempotency_key,
            created_at: decode_time(&created_at)?,
        })
    }
}
