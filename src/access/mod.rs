//! Access logging for sensitive resources.

pub mod logger;
pub mod record;

pub use logger::{AccessFilter, AccessInspector, AccessLogger, NoopInspector};
pub use record::{AccessAction, AccessRecord, AccessRequest, ReasonCategory};
