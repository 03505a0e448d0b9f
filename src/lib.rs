pub mod access;
pub mod api;
pub mod config;
pub mod consent;
pub mod database;
pub mod error;
pub mod external;
pub mod health;
pub mod isolation;
pub mod ledger;
pub mod report;

pub use config::ComplianceConfig;
pub use database::Database;
pub use error::{ComplianceError, ComplianceResult, ValidationError};
