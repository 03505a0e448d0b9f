//! Narrow interfaces to collaborators outside the compliance core.

pub mod clinical;
pub mod identity;

pub use clinical::{ClinicalDataStore, ClinicalSnapshot, InMemoryClinicalStore, Period};
pub use identity::{Actor, IdentityProvider, StaticIdentity};
