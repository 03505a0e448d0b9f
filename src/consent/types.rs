use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{decode_optional_time, decode_time};
use crate::error::{ComplianceError, ComplianceResult, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Pending,
    Obtained,
    Refused,
    Revoked,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Obtained => "obtained",
            ConsentStatus::Refused => "refused",
            ConsentStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConsentStatus::Pending),
            "obtained" => Some(ConsentStatus::Obtained),
            "refused" => Some(ConsentStatus::Refused),
            "revoked" => Some(ConsentStatus::Revoked),
            _ => None,
        }
    }

    /// No transition leaves a terminal status; a new record starts the next cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsentStatus::Refused | ConsentStatus::Revoked)
    }

    /// Legal edges: pending -> obtained | refused, obtained -> revoked.
    pub fn can_transition_to(&self, next: ConsentStatus) -> bool {
        matches!(
            (self, next),
            (ConsentStatus::Pending, ConsentStatus::Obtained)
                | (ConsentStatus::Pending, ConsentStatus::Refused)
                | (ConsentStatus::Obtained, ConsentStatus::Revoked)
        )
    }
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the patient-facing form reports about how consent was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub scroll_completed: bool,
    pub checkbox_confirmed: bool,
}

impl Acknowledgment {
    pub fn complete() -> Self {
        Self {
            scroll_completed: true,
            checkbox_confirmed: true,
        }
    }

    pub fn validate(&self) -> ComplianceResult<()> {
        if self.scroll_completed && self.checkbox_confirmed {
            Ok(())
        } else {
            Err(ValidationError::IncompleteAcknowledgment.into())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentTemplate {
    pub id: i64,
    pub tenant_id: String,
    pub consent_type: String,
    pub version: i64,
    pub title: String,
    pub required_for_care: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ConsentTemplate {
    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let created_at: String = row.get("created_at");
        Ok(Self {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            consent_type: row.get("consent_type"),
            version: row.get("version"),
            title: row.get("title"),
            required_for_care: row.get("required_for_care"),
            active: row.get("active"),
            created_at: decode_time(&created_at)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: i64,
    pub tenant_id: String,
    pub patient_id: String,
    pub template_id: i64,
    pub consent_type: String,
    pub status: ConsentStatus,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
    pub obtained_at: Option<DateTime<Utc>>,
    pub refused_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub refusal_reason: Option<String>,
    pub revocation_reason: Option<String>,
    pub signature: Option<Value>,
}

impl ConsentRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let created_at: String = row.get("created_at");
        let signature: Option<String> = row.get("signature");
        Ok(Self {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            patient_id: row.get("patient_id"),
            template_id: row.get("template_id"),
            consent_type: row.get("consent_type"),
            status: parse_status(row.get("status"))?,
            actor_id: row.get("actor_id"),
            created_at: decode_time(&created_at)?,
            obtained_at: decode_optional_time(row.get("obtained_at"))?,
            refused_at: decode_optional_time(row.get("refused_at"))?,
            revoked_at: decode_optional_time(row.get("revoked_at"))?,
            revoked_by: row.get("revoked_by"),
            refusal_reason: row.get("refusal_reason"),
            revocation_reason: row.get("revocation_reason"),
            signature: signature.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

/// One status change of one consent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentAudit {
    pub id: i64,
    pub consent_id: i64,
    pub tenant_id: String,
    pub patient_id: String,
    pub consent_type: String,
    pub previous_status: Option<ConsentStatus>,
    pub new_status: ConsentStatus,
    pub actor_id: String,
    pub reason: Option<String>,
    pub ledger_sequence_no: i64,
    pub created_at: DateTime<Utc>,
}

impl ConsentAudit {
    pub(crate) fn from_row(row: &SqliteRow) -> ComplianceResult<Self> {
        let previous: Option<String> = row.get("previous_status");
        let created_at: String = row.get("created_at");
        Ok(Self {
            id: row.get("id"),
            consent_id: row.get("consent_id"),
            tenant_id: row.get("tenant_id"),
            patient_id: row.get("patient_id"),
            consent_type: row.get("consent_type"),
            previous_status: previous.map(parse_status).transpose()?,
            new_status: parse_status(row.get("new_status"))?,
            actor_id: row.get("actor_id"),
            reason: row.get("reason"),
            ledger_sequence_no: row.get("ledger_sequence_no"),
            created_at: decode_time(&created_at)?,
        })
    }
}

fn parse_status(raw: String) -> ComplianceResult<ConsentStatus> {
    ConsentStatus::from_str(&raw)
        .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown consent status: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ConsentStatus::*;
        let all = [Pending, Obtained, Refused, Revoked];
        let legal: Vec<(ConsentStatus, ConsentStatus)> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(legal, vec![(Pending, Obtained), (Pending, Refused), (Obtained, Revoked)]);
        assert!(Refused.is_terminal());
        assert!(!Obtained.is_terminal());
    }

    #[test]
    fn test_acknowledgment_requires_both_flags() {
        assert!(Acknowledgment::complete().validate().is_ok());
        let scrolled_only = Acknowledgment {
            scroll_completed: true,
            checkbox_confirmed: false,
        };
        assert!(matches!(
            scrolled_only.validate(),
            Err(ComplianceError::Validation(ValidationError::IncompleteAcknowledgment))
        ));
        assert!(Acknowledgment::default().validate().is_err());
    }
}
