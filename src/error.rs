use thiserror::Error;

use crate::consent::ConsentStatus;

/// SQLite primary result codes that signal lock contention rather than a bad query.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<serde_json::Error> for ComplianceError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for ComplianceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::StoreUnavailable(format!("Store unavailable: {}", err))
            }
            sqlx::Error::Database(db) if is_contention(db.code().as_deref()) => {
                Self::StoreUnavailable(format!("Store busy: {}", db.message()))
            }
            _ => Self::DatabaseError(format!("Database error: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ComplianceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::StoreUnavailable("Store operation timed out".to_string())
    }
}

fn is_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Caller mistakes rejected before anything is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Access justification is required")]
    MissingJustification,

    #[error("Consent requires both scroll completion and checkbox confirmation")]
    IncompleteAcknowledgment,

    #[error("A reason is required for this transition")]
    MissingReason,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid consent transition: {current} -> {requested}")]
    InvalidTransition {
        current: ConsentStatus,
        requested: ConsentStatus,
    },

    #[error("Concurrent append conflict for tenant {tenant_id} at sequence {sequence_no}")]
    ConcurrentAppendConflict { tenant_id: String, sequence_no: i64 },

    #[error("{0}")]
    StoreUnavailable(String),

    #[error("Ledger integrity violation for tenant {tenant_id} at sequence {sequence_no}")]
    IntegrityViolation { tenant_id: String, sequence_no: i64 },

    #[error("Isolation alert {0} is already resolved")]
    AlreadyResolved(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    SerializationError(String),
}

pub type ComplianceResult<T> = Result<T, ComplianceError>;

impl ComplianceError {
    /// Transient failures the caller may retry after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentAppendConflict { .. } | Self::StoreUnavailable(_)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidInput(msg.into()))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
