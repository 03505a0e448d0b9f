//! Merkle root over ledger entry hashes
//!
//! Pins the exact evidence set behind a certification report: one digest
//! that changes if any entry in the range is added, dropped or altered.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ledger::entry::LedgerEntry;

fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Root over `entries` in the given order; `None` for an empty range.
pub fn merkle_root(entries: &[LedgerEntry]) -> Option<String> {
    let mut level: Vec<String> = entries.iter().map(|e| e.entry_hash.clone()).collect();
    if level.is_empty() {
        return None;
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => combine(left, right),
                // Odd node is paired with itself.
                [single] => combine(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    let root = level.pop();
    debug!("Merkle root over {} entries: {:?}", entries.len(), root);
    root
}

pub fn verify_merkle_root(entries: &[LedgerEntry], claimed_root: &str) -> bool {
    merkle_root(entries).as_deref() == Some(claimed_root)
}
