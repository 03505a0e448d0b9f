//! Ledger Verification
//!
//! Linear walk over a tenant chain, recomputing every hash from the
//! entry's fields and the previous entry's stored hash.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ledger::entry::{LedgerEntry, GENESIS_HASH};

/// Why a chain walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Recomputed hash differs from the stored one.
    HashMismatch,
    /// Stored previous-hash does not match the prior entry's hash.
    LinkMismatch,
    /// A sequence number is missing or out of place.
    SequenceGap,
    /// The recorded chain head disagrees with the last entry.
    HeadMismatch,
    /// The stored row no longer decodes into an entry.
    Undecodable,
}

/// Where a walk starts: the entry just before the first one checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAnchor {
    pub sequence_no: i64,
    pub entry_hash: String,
}

impl ChainAnchor {
    pub fn genesis() -> Self {
        Self {
            sequence_no: 0,
            entry_hash: GENESIS_HASH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub tenant_id: String,
    pub is_valid: bool,
    /// Entries examined, including the one that broke the chain.
    pub total_checked: u64,
    pub first_break_sequence: Option<i64>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub break_kind: Option<BreakKind>,
    /// Last sequence number confirmed intact.
    pub verified_through: i64,
}

impl VerificationResult {
    pub fn empty(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            is_valid: true,
            total_checked: 0,
            first_break_sequence: None,
            expected_hash: None,
            actual_hash: None,
            break_kind: None,
            verified_through: 0,
        }
    }

    pub(crate) fn broken(
        mut self,
        sequence_no: i64,
        kind: BreakKind,
        expected: Option<String>,
        actual: Option<String>,
    ) -> Self {
        self.is_valid = false;
        self.first_break_sequence = Some(sequence_no);
        self.break_kind = Some(kind);
        self.expected_hash = expected;
        self.actual_hash = actual;
        self
    }

    pub fn summary(&self) -> String {
        if self.is_valid {
            format!(
                "Ledger for {} is valid ({} entries checked)",
                self.tenant_id, self.total_checked
            )
        } else {
            format!(
                "Ledger for {} is broken at sequence {} ({:?}): expected {}, found {}",
                self.tenant_id,
                self.first_break_sequence.unwrap_or_default(),
                self.break_kind,
                self.expected_hash.as_deref().unwrap_or("-"),
                self.actual_hash.as_deref().unwrap_or("-")
            )
        }
    }
}

/// Walk `entries` (ascending) from `anchor`, stopping at the first break.
pub fn verify_entries(tenant_id: &str, entries: &[LedgerEntry], anchor: &ChainAnchor) -> VerificationResult {
    let mut result = VerificationResult::empty(tenant_id);
    result.verified_through = anchor.sequence_no;

    let mut expected_sequence = anchor.sequence_no + 1;
    let mut previous_hash = anchor.entry_hash.as_str();

    for entry in entries {
        result.total_checked += 1;

        if entry.tenant_id != tenant_id || entry.sequence_no != expected_sequence {
            warn!(
                "Sequence gap in {}: expected {}, found {}",
                tenant_id, expected_sequence, entry.sequence_no
            );
            return result.broken(expected_sequence, BreakKind::SequenceGap, None, None);
        }

        if entry.previous_entry_hash != previous_hash {
            warn!("Chain link broken in {} at {}", tenant_id, entry.sequence_no);
            return result.broken(
                entry.sequence_no,
                BreakKind::LinkMismatch,
                Some(previous_hash.to_string()),
                Some(entry.previous_entry_hash.clone()),
            );
        }

        let recomputed = entry.hash_with_previous(previous_hash);
        if recomputed != entry.entry_hash {
            warn!("Hash mismatch in {} at {}", tenant_id, entry.sequence_no);
            return result.broken(
                entry.sequence_no,
                BreakKind::HashMismatch,
                Some(recomputed),
                Some(entry.entry_hash.clone()),
            );
        }

        result.verified_through = entry.sequence_no;
        previous_hash = &entry.entry_hash;
        expected_sequence += 1;
    }

    debug!(
        "Verified {} entries for {} through {}",
        result.total_checked, tenant_id, result.verified_through
    );
    result
}

/// Sequence numbers of every entry whose own hash fails, without stopping early.
pub fn find_tampered_entries(entries: &[LedgerEntry]) -> Vec<i64> {
    let tampered: Vec<i64> = entries
        .iter()
        .filter(|entry| !entry.verify_hash())
        .map(|entry| entry.sequence_no)
        .collect();

    if !tampered.is_empty() {
        info!("Found {} entries with invalid hashes", tampered.len());
    }
    tampered
}
