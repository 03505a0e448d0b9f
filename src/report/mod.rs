//! Certification reports and subject exports.

pub mod certification;
pub mod export;

pub use certification::{
    ActivityCounts, CertificationReport, ChainEvidence, CheckSummary, OverallStatus, ReportGenerator,
};
pub use export::SubjectExport;
