//! Tamper-evident, per-tenant hash-chained ledger.

pub mod entry;
pub mod merkle;
pub mod store;
pub mod verify;

pub use entry::{EventType, LedgerDraft, LedgerEntry, GENESIS_HASH};
pub use merkle::{merkle_root, verify_merkle_root};
pub use store::{ChainHead, LedgerFilter, LedgerStore, LedgerTxn};
pub use verify::{find_tampered_entries, BreakKind, ChainAnchor, VerificationResult};
