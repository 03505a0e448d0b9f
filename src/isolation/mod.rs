//! Cross-tenant isolation monitoring.

pub mod alert;
pub mod monitor;

pub use alert::{AlertStatus, IsolationAlert};
pub use monitor::IsolationMonitor;
