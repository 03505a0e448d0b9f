//! Periodic compliance health checks.

pub mod checks;
pub mod scheduler;
pub mod types;

pub use checks::ComplianceChecks;
pub use scheduler::HealthCheckScheduler;
pub use types::{CheckOutcome, CheckStatus, CheckType, HealthCheckResult};
