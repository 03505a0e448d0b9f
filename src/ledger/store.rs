//! Ledger Store
//!
//! Owns the per-tenant hash chain. Appends for one tenant are serialized by
//! a per-tenant async mutex and backed by a compare-and-swap on the chain
//! head row, so two writers can never both link onto the same previous hash.
//! Tenants never contend with each other for a lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::database::{decode_time, encode_time, now, Database};
use crate::error::{ComplianceError, ComplianceResult};
use crate::ledger::entry::{EventType, LedgerDraft, LedgerEntry, GENESIS_HASH};
use crate::ledger::verify::{verify_entries, BreakKind, ChainAnchor, VerificationResult};

/// Last appended entry of a tenant chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub tenant_id: String,
    pub sequence_no: i64,
    pub entry_hash: String,
}

/// Read filters; time bounds are `[since, until)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub event_type: Option<EventType>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub max_sequence: Option<i64>,
    pub limit: Option<i64>,
}

impl LedgerFilter {
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: Option<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = resource_id;
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn up_to_sequence(mut self, max_sequence: i64) -> Self {
        self.max_sequence = Some(max_sequence);
        self
    }
}

#[derive(Default)]
struct TenantLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantLocks {
    fn lock_for(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    db: Database,
    locks: Arc<TenantLocks>,
}

impl LedgerStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(TenantLocks::default()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open an exclusive write session on one tenant chain.
    ///
    /// The session holds the tenant lock and a single SQL transaction, so
    /// callers can append entries and write their own rows atomically.
    pub async fn begin(&self, tenant_id: &str) -> ComplianceResult<LedgerTxn> {
        if tenant_id.trim().is_empty() {
            return Err(ComplianceError::invalid_input("tenant_id must not be empty"));
        }

        let lock = self.locks.lock_for(tenant_id);
        let timeout = self.db.timeout();
        let (guard, tx) = tokio::time::timeout(timeout, async {
            let guard = lock.lock_owned().await;
            let mut tx = self.db.pool().begin().await?;
            // Take the write lock before the first read so the head we read cannot go stale.
            sqlx::query("UPDATE ledger_heads SET tenant_id = tenant_id WHERE 0")
                .execute(&mut *tx)
                .await?;
            Ok::<_, ComplianceError>((guard, tx))
        })
        .await??;

        Ok(LedgerTxn {
            tenant_id: tenant_id.to_string(),
            tx,
            _guard: guard,
            timeout,
            appended: 0,
        })
    }

    /// Append one entry and commit it.
    pub async fn append(&self, tenant_id: &str, draft: LedgerDraft) -> ComplianceResult<LedgerEntry> {
        let mut txn = self.begin(tenant_id).await?;
        let entry = txn.append(draft).await?;
        txn.commit().await?;
        Ok(entry)
    }

    pub async fn head(&self, tenant_id: &str) -> ComplianceResult<Option<ChainHead>> {
        self.db
            .bounded(async {
                let mut conn = self.db.pool().acquire().await?;
                read_head(&mut conn, tenant_id).await
            })
            .await
    }

    /// Number of entries in a tenant chain.
    pub async fn count(&self, tenant_id: &str) -> ComplianceResult<i64> {
        Ok(self.head(tenant_id).await?.map(|h| h.sequence_no).unwrap_or(0))
    }

    /// Tenants that have at least one ledger entry.
    pub async fn tenants(&self) -> ComplianceResult<Vec<String>> {
        self.db
            .bounded(async {
                let rows = sqlx::query("SELECT tenant_id FROM ledger_heads ORDER BY tenant_id")
                    .fetch_all(self.db.pool())
                    .await?;
                Ok(rows.iter().map(|r| r.get::<String, _>("tenant_id")).collect())
            })
            .await
    }

    /// Verify a tenant chain over `[from, to]` against a snapshot taken when the scan starts.
    pub async fn verify_chain(
        &self,
        tenant_id: &str,
        from_sequence: Option<i64>,
        to_sequence: Option<i64>,
    ) -> ComplianceResult<VerificationResult> {
        self.db
            .bounded(async {
                // A read transaction pins the snapshot; later appends stay invisible.
                let mut tx = self.db.pool().begin().await?;
                let result = verify_in_snapshot(&mut tx, tenant_id, from_sequence, to_sequence).await;
                tx.rollback().await?;
                result
            })
            .await
            .map(|result| {
                if result.is_valid {
                    debug!("{}", result.summary());
                } else {
                    warn!("{}", result.summary());
                }
                result
            })
    }

    pub async fn read(&self, tenant_id: &str, filter: &LedgerFilter) -> ComplianceResult<Vec<LedgerEntry>> {
        self.db
            .bounded(async {
                let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM ledger_entries WHERE tenant_id = ");
                query.push_bind(tenant_id.to_string());
                if let Some(event_type) = filter.event_type {
                    query.push(" AND event_type = ").push_bind(event_type.as_str());
                }
                if let Some(resource_type) = &filter.resource_type {
                    query.push(" AND resource_type = ").push_bind(resource_type.clone());
                }
                if let Some(resource_id) = &filter.resource_id {
                    query.push(" AND resource_id = ").push_bind(resource_id.clone());
                }
                if let Some(since) = &filter.since {
                    query.push(" AND timestamp >= ").push_bind(encode_time(since));
                }
                if let Some(until) = &filter.until {
                    query.push(" AND timestamp < ").push_bind(encode_time(until));
                }
                if let Some(max_sequence) = filter.max_sequence {
                    query.push(" AND sequence_no <= ").push_bind(max_sequence);
                }
                query.push(" ORDER BY sequence_no ASC");
                if let Some(limit) = filter.limit {
                    query.push(" LIMIT ").push_bind(limit);
                }

                let rows = query.build().fetch_all(self.db.pool()).await?;
                rows.iter().map(entry_from_row).collect()
            })
            .await
    }

    /// First and last sequence numbers with timestamps in `[since, until)`, capped at `max_sequence`.
    pub async fn sequence_bounds(
        &self,
        tenant_id: &str,
        since: &DateTime<Utc>,
        until: &DateTime<Utc>,
        max_sequence: i64,
    ) -> ComplianceResult<Option<(i64, i64)>> {
        self.db
            .bounded(async {
                let row = sqlx::query(
                    r#"
                    SELECT MIN(sequence_no) AS first_seq, MAX(sequence_no) AS last_seq
                    FROM ledger_entries
                    WHERE tenant_id = ? AND timestamp >= ? AND timestamp < ? AND sequence_no <= ?
                    "#,
                )
                .bind(tenant_id)
                .bind(encode_time(since))
                .bind(encode_time(until))
                .bind(max_sequence)
                .fetch_one(self.db.pool())
                .await?;

                let first: Option<i64> = row.get("first_seq");
                let last: Option<i64> = row.get("last_seq");
                Ok(first.zip(last))
            })
            .await
    }
}

/// Exclusive write session on one tenant chain; dropped without `commit` it rolls back.
pub struct LedgerTxn {
    tenant_id: String,
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
    timeout: Duration,
    appended: usize,
}

impl LedgerTxn {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Connection for rows that must commit together with the chain entries.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn append(&mut self, draft: LedgerDraft) -> ComplianceResult<LedgerEntry> {
        let timeout = self.timeout;
        let entry = tokio::time::timeout(timeout, self.append_inner(draft)).await??;
        self.appended += 1;
        Ok(entry)
    }

    async fn append_inner(&mut self, draft: LedgerDraft) -> ComplianceResult<LedgerEntry> {
        let tenant_id = self.tenant_id.clone();
        let head = read_head(&mut self.tx, &tenant_id).await?;
        let (sequence_no, previous_hash) = match &head {
            Some(head) => (head.sequence_no + 1, head.entry_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };

        let entry = LedgerEntry::seal(&tenant_id, sequence_no, now(), draft, previous_hash);
        let conflict = || ComplianceError::ConcurrentAppendConflict {
            tenant_id: tenant_id.clone(),
            sequence_no,
        };

        sqlx::query(
            r#"
            INSERT INTO ledger_entries
            (tenant_id, sequence_no, timestamp, event_type, actor_id, resource_type, resource_id,
             action, previous_value, new_value, previous_entry_hash, entry_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(entry.sequence_no)
        .bind(encode_time(&entry.timestamp))
        .bind(entry.event_type.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.action)
        .bind(entry.previous_value.as_ref().map(|v| v.to_string()))
        .bind(entry.new_value.as_ref().map(|v| v.to_string()))
        .bind(&entry.previous_entry_hash)
        .bind(&entry.entry_hash)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_unique_violation(e, conflict))?;

        // Compare-and-swap the head: only succeeds if nobody moved it since we read it.
        let swapped = match &head {
            Some(head) => sqlx::query(
                r#"
                UPDATE ledger_heads SET sequence_no = ?, entry_hash = ?, updated_at = ?
                WHERE tenant_id = ? AND sequence_no = ? AND entry_hash = ?
                "#,
            )
            .bind(entry.sequence_no)
            .bind(&entry.entry_hash)
            .bind(encode_time(&entry.timestamp))
            .bind(&tenant_id)
            .bind(head.sequence_no)
            .bind(&head.entry_hash)
            .execute(&mut *self.tx)
            .await?
            .rows_affected(),
            None => sqlx::query(
                "INSERT INTO ledger_heads (tenant_id, sequence_no, entry_hash, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&tenant_id)
            .bind(entry.sequence_no)
            .bind(&entry.entry_hash)
            .bind(encode_time(&entry.timestamp))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_unique_violation(e, conflict))?
            .rows_affected(),
        };
        if swapped != 1 {
            return Err(conflict());
        }

        debug!("Appended ledger entry {}", entry.summary());
        Ok(entry)
    }

    pub async fn commit(self) -> ComplianceResult<()> {
        let tenant_id = self.tenant_id;
        let appended = self.appended;
        tokio::time::timeout(self.timeout, self.tx.commit()).await??;
        if appended > 0 {
            info!("Committed {} ledger entries for tenant {}", appended, tenant_id);
        }
        Ok(())
    }
}

fn map_unique_violation(err: sqlx::Error, conflict: impl FnOnce() -> ComplianceError) -> ComplianceError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => conflict(),
        _ => err.into(),
    }
}

pub(crate) async fn read_head(conn: &mut SqliteConnection, tenant_id: &str) -> ComplianceResult<Option<ChainHead>> {
    let row = sqlx::query("SELECT sequence_no, entry_hash FROM ledger_heads WHERE tenant_id = ?")
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|row| ChainHead {
        tenant_id: tenant_id.to_string(),
        sequence_no: row.get("sequence_no"),
        entry_hash: row.get("entry_hash"),
    }))
}

async fn verify_in_snapshot(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    from_sequence: Option<i64>,
    to_sequence: Option<i64>,
) -> ComplianceResult<VerificationResult> {
    let Some(head) = read_head(conn, tenant_id).await? else {
        return Ok(VerificationResult::empty(tenant_id));
    };

    let bound = head.sequence_no;
    let from = from_sequence.unwrap_or(1).max(1);
    let to = to_sequence.map(|t| t.min(bound)).unwrap_or(bound);
    if from > to {
        return Ok(VerificationResult::empty(tenant_id));
    }

    let anchor = if from == 1 {
        ChainAnchor::genesis()
    } else {
        let previous = sqlx::query("SELECT entry_hash FROM ledger_entries WHERE tenant_id = ? AND sequence_no = ?")
            .bind(tenant_id)
            .bind(from - 1)
            .fetch_optional(&mut *conn)
            .await?;
        match previous {
            Some(row) => ChainAnchor {
                sequence_no: from - 1,
                entry_hash: row.get("entry_hash"),
            },
            None => {
                return Ok(VerificationResult::empty(tenant_id).broken(from - 1, BreakKind::SequenceGap, None, None));
            }
        }
    };

    let rows = sqlx::query(
        r#"
        SELECT * FROM ledger_entries
        WHERE tenant_id = ? AND sequence_no BETWEEN ? AND ?
        ORDER BY sequence_no ASC
        "#,
    )
    .bind(tenant_id)
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    // Decode row by row; a row that no longer decodes ends the walk.
    let mut entries = Vec::with_capacity(rows.len());
    let mut undecodable = None;
    for row in &rows {
        match entry_from_row(row) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                let sequence_no = row.try_get::<i64, _>("sequence_no").ok();
                warn!(
                    "Ledger entry {:?} of {} cannot be decoded: {}",
                    sequence_no, tenant_id, e
                );
                undecodable = Some((sequence_no, row.try_get::<String, _>("entry_hash").ok()));
                break;
            }
        }
    }

    let mut result = verify_entries(tenant_id, &entries, &anchor);
    if let Some((sequence_no, stored_hash)) = undecodable {
        if result.is_valid {
            let expected = result.verified_through + 1;
            result.total_checked += 1;
            result = match sequence_no {
                Some(found) if found != expected => result.broken(expected, BreakKind::SequenceGap, None, None),
                _ => result.broken(expected, BreakKind::Undecodable, None, stored_hash),
            };
        }
        return Ok(result);
    }
    if result.is_valid && result.verified_through < to {
        // Tail entries missing below the recorded head.
        let missing = result.verified_through + 1;
        result = result.broken(missing, BreakKind::SequenceGap, None, None);
    }
    if result.is_valid && to == bound {
        if let Some(last) = entries.last() {
            if last.entry_hash != head.entry_hash {
                result = result.broken(
                    bound,
                    BreakKind::HeadMismatch,
                    Some(head.entry_hash.clone()),
                    Some(last.entry_hash.clone()),
                );
            }
        }
    }
    Ok(result)
}

pub(crate) fn entry_from_row(row: &SqliteRow) -> ComplianceResult<LedgerEntry> {
    let raw_event: String = row.try_get("event_type")?;
    let event_type = EventType::from_str(&raw_event)
        .ok_or_else(|| ComplianceError::DatabaseError(format!("Unknown event type: {}", raw_event)))?;
    let previous_value: Option<String> = row.try_get("previous_value")?;
    let new_value: Option<String> = row.try_get("new_value")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(LedgerEntry {
        tenant_id: row.try_get("tenant_id")?,
        sequence_no: row.try_get("sequence_no")?,
        timestamp: decode_time(&timestamp)?,
        event_type,
        actor_id: row.try_get("actor_id")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        previous_value: previous_value.as_deref().map(serde_json::from_str).transpose()?,
        new_value: new_value.as_deref().map(serde_json::from_str).transpose()?,
        previous_entry_hash: row.try_get("previous_entry_hash")?,
        entry_hash: row.try_get("entry_hash")?,
    })
}
