//! Ledger Entry
//!
//! Immutable, hash-chained records of sensitive actions. Each entry's hash
//! covers the previous entry's hash plus a canonical serialization of its
//! own fields, so any retroactive edit breaks the chain from that point on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::database::encode_time;

/// Previous-hash value carried by the first entry of every tenant chain.
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserAction,
    DataAccess,
    DataModification,
    Export,
    SecurityEvent,
    SystemEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserAction => "user_action",
            EventType::DataAccess => "data_access",
            EventType::DataModification => "data_modification",
            EventType::Export => "export",
            EventType::SecurityEvent => "security_event",
            EventType::SystemEvent => "system_event",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user_action" => Some(EventType::UserAction),
            "data_access" => Some(EventType::DataAccess),
            "data_modification" => Some(EventType::DataModification),
            "export" => Some(EventType::Export),
            "security_event" => Some(EventType::SecurityEvent),
            "system_event" => Some(EventType::SystemEvent),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a writer submits; the store assigns sequence, timestamp and hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDraft {
    pub event_type: EventType,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl LedgerDraft {
    pub fn new(event_type: EventType, resource_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event_type,
            actor_id: None,
            resource_type: resource_type.into(),
            resource_id: None,
            action: action.into(),
            previous_value: None,
            new_value: None,
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn previous_value(mut self, value: Value) -> Self {
        self.previous_value = Some(value);
        self
    }

    pub fn new_value(mut self, value: Value) -> Self {
        self.new_value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tenant_id: String,
    pub sequence_no: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub previous_entry_hash: String,
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Build the entry at `sequence_no` and compute its hash.
    pub fn seal(
        tenant_id: &str,
        sequence_no: i64,
        timestamp: DateTime<Utc>,
        draft: LedgerDraft,
        previous_entry_hash: String,
    ) -> Self {
        let mut entry = Self {
            tenant_id: tenant_id.to_string(),
            sequence_no,
            timestamp,
            event_type: draft.event_type,
            actor_id: draft.actor_id,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            action: draft.action,
            previous_value: draft.previous_value,
            new_value: draft.new_value,
            previous_entry_hash,
            entry_hash: String::new(),
        };

        entry.entry_hash = entry.calculate_hash();
        entry
    }

    /// Canonical serialization of every field except the two hashes.
    pub fn canonical_string(&self) -> String {
        json!([
            self.tenant_id,
            self.sequence_no,
            encode_time(&self.timestamp),
            self.event_type.as_str(),
            self.actor_id,
            self.resource_type,
            self.resource_id,
            self.action,
            self.previous_value.as_ref().map(canonical_value),
            self.new_value.as_ref().map(canonical_value),
        ])
        .to_string()
    }

    /// Hash of this entry chained onto `previous_hash`.
    pub fn hash_with_previous(&self, previous_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_string().as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    pub fn calculate_hash(&self) -> String {
        self.hash_with_previous(&self.previous_entry_hash)
    }

    pub fn verify_hash(&self) -> bool {
        self.entry_hash == self.calculate_hash()
    }

    /// Does this entry link onto `previous`?
    pub fn follows(&self, previous: &LedgerEntry) -> bool {
        self.sequence_no == previous.sequence_no + 1
            && self.previous_entry_hash == previous.entry_hash
    }

    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} {} on {}/{}",
            self.tenant_id,
            self.sequence_no,
            self.event_type,
            self.action,
            self.resource_type,
            self.resource_id.as_deref().unwrap_or("-")
        )
    }
}

/// Rebuild `value` with object keys in sorted order at every depth.
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical_value(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_draft() -> LedgerDraft {
        LedgerDraft::new(EventType::DataAccess, "patient", "view")
            .actor("dr-house")
            .resource_id("p-1")
            .new_value(json!({"fields": ["name"], "reason": "follow-up"}))
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_entry_creation() {
        let entry = LedgerEntry::seal("clinic-a", 1, fixed_time(), sample_draft(), GENESIS_HASH.to_string());

        assert_eq!(entry.tenant_id, "clinic-a");
        assert_eq!(entry.sequence_no, 1);
        assert_eq!(entry.previous_entry_hash, GENESIS_HASH);
        assert!(entry.verify_hash());
    }

    #[test]
    fn test_hash_calculation() {
        let entry = LedgerEntry::seal("clinic-a", 1, fixed_time(), sample_draft(), GENESIS_HASH.to_string());

        let hash1 = entry.calculate_hash();
        let hash2 = entry.calculate_hash();
        assert_eq!(hash1, hash2);
        assert!(hash1.starts_with("sha256:"));
        assert_eq!(hash1.len(), 71);
    }

    #[test]
    fn test_hash_depends_on_previous_hash() {
        let entry = LedgerEntry::seal("clinic-a", 2, fixed_time(), sample_draft(), GENESIS_HASH.to_string());
        assert_ne!(entry.hash_with_previous(GENESIS_HASH), entry.hash_with_previous("sha256:other"));
    }

    #[test]
    fn test_field_edit_detected() {
        let mut entry = LedgerEntry::seal("clinic-a", 1, fixed_time(), sample_draft(), GENESIS_HASH.to_string());
        entry.action = "export".to_string();
        assert!(!entry.verify_hash());
    }

    #[test]
    fn test_payload_key_order_is_irrelevant() {
        let a = LedgerDraft::new(EventType::DataModification, "consent", "obtain")
            .new_value(json!({"a": 1, "b": {"y": 2, "x": 3}}));
        let mut b = a.clone();
        let mut inner = Map::new();
        inner.insert("x".to_string(), json!(3));
        inner.insert("y".to_string(), json!(2));
        let mut outer = Map::new();
        outer.insert("b".to_string(), Value::Object(inner));
        outer.insert("a".to_string(), json!(1));
        b.new_value = Some(Value::Object(outer));

        let ea = LedgerEntry::seal("t", 1, fixed_time(), a, GENESIS_HASH.to_string());
        let eb = LedgerEntry::seal("t", 1, fixed_time(), b, GENESIS_HASH.to_string());
        assert_eq!(ea.entry_hash, eb.entry_hash);
    }

    #[test]
    fn test_follows() {
        let first = LedgerEntry::seal("t", 1, fixed_time(), sample_draft(), GENESIS_HASH.to_string());
        let second = LedgerEntry::seal("t", 2, fixed_time(), sample_draft(), first.entry_hash.clone());
        assert!(second.follows(&first));
        assert!(!first.follows(&second));
    }

    #[test]
    fn test_event_type_round_trip() {
        for event in [
            EventType::UserAction,
            EventType::DataAccess,
            EventType::DataModification,
            EventType::Export,
            EventType::SecurityEvent,
            EventType::SystemEvent,
        ] {
            assert_eq!(EventType::from_str(event.as_str()), Some(event));
        }
        assert_eq!(EventType::from_str("bogus"), None);
    }
}
