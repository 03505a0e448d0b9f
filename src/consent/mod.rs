//! Patient consent lifecycle.

pub mod tracker;
pub mod types;

pub use tracker::ConsentTracker;
pub use types::{Acknowledgment, ConsentAudit, ConsentRecord, ConsentStatus, ConsentTemplate};
