//! SQLite implementation of the Store trait.
//!
//! The primary storage backend. Uses rusqlite with bundled SQLite, wrapped
//! in async via `tokio::task::spawn_blocking` over an `Arc<Mutex<Connection>>`.
//! The single connection serializes all writers, so a commit transaction
//! is also the linearization point for the chain.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use balancechain_core::consts::GENESIS;
use balancechain_core::{Hid, Segment, SegmentKind};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::records::{
    CapsPeriod, CapsRow, CapsuleRecord, CapsuleStatus, CommitBatch, IdentityRecord, MessageRecord,
};
use crate::traits::{meta_keys, Store};

/// SQLite-based store implementation.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database. Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn exec<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn row_to_segment(body: String) -> Result<Segment> {
    Segment::from_json(&body).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

fn set_meta_value(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_meta(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.exec(move |conn| get_meta_value(conn, &key)).await
    }

    async fn set_meta(&self, key: &str, value: &Value) -> Result<()> {
        let key = key.to_string();
        let value = value.clone();
        self.exec(move |conn| set_meta_value(conn, &key, &value))
            .await
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.exec(move |conn| {
            conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn chain_head(&self) -> Result<String> {
        self.exec(|conn| {
            Ok(match get_meta_value(conn, meta_keys::CHAIN_HEAD)? {
                Some(Value::String(head)) => head,
                _ => GENESIS.to_string(),
            })
        })
        .await
    }

    async fn chain_len(&self) -> Result<u64> {
        self.exec(|conn| {
            Ok(match get_meta_value(conn, meta_keys::CHAIN_LEN)? {
                Some(value) => value.as_u64().unwrap_or(0),
                None => 0,
            })
        })
        .await
    }

    async fn set_chain_state(&self, head: &str, len: u64) -> Result<()> {
        let head = head.to_string();
        self.exec(move |conn| {
            let tx = conn.transaction()?;
            set_meta_value(&tx, meta_keys::CHAIN_HEAD, &Value::String(head))?;
            set_meta_value(&tx, meta_keys::CHAIN_LEN, &Value::from(len))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_segment(&self, seq: u64) -> Result<Option<Segment>> {
        self.exec(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM state_chain WHERE seq = ?1",
                    params![seq as i64],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(row_to_segment).transpose()
        })
        .await
    }

    async fn get_segments_range(&self, start: u64, end: u64) -> Result<Vec<Segment>> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM state_chain WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq",
            )?;
            let bodies = stmt
                .query_map(params![start as i64, end as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies.into_iter().map(row_to_segment).collect()
        })
        .await
    }

    async fn segments_by_kind(&self, kind: SegmentKind) -> Result<Vec<Segment>> {
        self.exec(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM state_chain WHERE kind = ?1 ORDER BY seq")?;
            let bodies = stmt
                .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies.into_iter().map(row_to_segment).collect()
        })
        .await
    }

    async fn segment_count(&self) -> Result<u64> {
        self.exec(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM state_chain", [], |row| {
                row.get(0)
            })?;
            Ok(count as u64)
        })
        .await
    }

    async fn put_segment_unchecked(&self, segment: &Segment) -> Result<()> {
        let segment = segment.clone();
        self.exec(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO state_chain (seq, nonce, kind, ts, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(seq) DO UPDATE SET
                     nonce = excluded.nonce,
                     kind = excluded.kind,
                     ts = excluded.ts,
                     body = excluded.body",
                params![
                    segment.seq as i64,
                    segment.nonce,
                    segment.kind.as_str(),
                    segment.ts,
                    segment.to_canonical_json(),
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO sync_log (nonce, ts) VALUES (?1, ?2)",
                params![segment.nonce, segment.ts],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn has_nonce(&self, nonce: &str) -> Result<bool> {
        let nonce = nonce.to_string();
        self.exec(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sync_log WHERE nonce = ?1)",
                params![nonce],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn purge_nonces_before(&self, cutoff_ts: i64) -> Result<u64> {
        self.exec(move |conn| {
            let removed = conn.execute(
                "DELETE FROM sync_log WHERE ts < ?1",
                params![cutoff_ts],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn commit_segment(&self, batch: CommitBatch) -> Result<()> {
        self.exec(move |conn| {
            let seq = batch.segment.seq;
            let tx = conn.transaction()?;

            // Conflict check inside the transaction: another committer may
            // have taken this position between our head read and now.
            let occupied: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM state_chain WHERE seq = ?1 OR nonce = ?2",
                    params![seq as i64, batch.segment.nonce],
                    |row| row.get(0),
                )
                .optional()?;
            if occupied.is_some() {
                return Err(StoreError::Conflict { seq });
            }

            tx.execute(
                "INSERT INTO state_chain (seq, nonce, kind, ts, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    seq as i64,
                    batch.segment.nonce,
                    batch.segment.kind.as_str(),
                    batch.segment.ts,
                    batch.segment.to_canonical_json(),
                ],
            )?;

            tx.execute(
                "INSERT INTO sync_log (nonce, ts) VALUES (?1, ?2)",
                params![batch.segment.nonce, batch.segment.ts],
            )?;

            if let Some(message) = &batch.message {
                tx.execute(
                    "INSERT INTO messages (id, seq, peer, ts, tag, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        message.id,
                        message.seq as i64,
                        message.peer,
                        message.ts,
                        message.tag,
                        serde_json::to_string(message)?,
                    ],
                )?;
            }

            for (period, hid, row) in &batch.caps {
                tx.execute(
                    "INSERT INTO caps (key, count, resets_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                         count = excluded.count,
                         resets_at = excluded.resets_at",
                    params![period.key(hid), row.count as i64, row.resets_at],
                )?;
            }

            set_meta_value(&tx, meta_keys::CHAIN_HEAD, &Value::String(batch.new_head))?;
            set_meta_value(&tx, meta_keys::CHAIN_LEN, &Value::from(seq))?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn messages_for_peer(&self, peer: &str) -> Result<Vec<MessageRecord>> {
        let peer = peer.to_string();
        self.exec(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM messages WHERE peer = ?1 ORDER BY seq")?;
            let bodies = stmt
                .query_map(params![peer], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies
                .into_iter()
                .map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn replace_messages(&self, messages: Vec<MessageRecord>) -> Result<()> {
        self.exec(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages", [])?;
            for message in &messages {
                tx.execute(
                    "INSERT INTO messages (id, seq, peer, ts, tag, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        message.id,
                        message.seq as i64,
                        message.peer,
                        message.ts,
                        message.tag,
                        serde_json::to_string(message)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_identity(&self) -> Result<Option<IdentityRecord>> {
        self.exec(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM identity WHERE id = 'primary'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn put_identity(&self, record: &IdentityRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO identity (id, body) VALUES ('primary', ?1)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                params![body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_caps_row(&self, period: CapsPeriod, hid: &Hid) -> Result<Option<CapsRow>> {
        let key = period.key(hid);
        self.exec(move |conn| {
            let row: Option<(i64, Option<i64>)> = conn
                .query_row(
                    "SELECT count, resets_at FROM caps WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(count, resets_at)| CapsRow {
                count: count as u64,
                resets_at,
            }))
        })
        .await
    }

    async fn put_caps_row(&self, period: CapsPeriod, hid: &Hid, row: &CapsRow) -> Result<()> {
        let key = period.key(hid);
        let row = *row;
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO caps (key, count, resets_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     count = excluded.count,
                     resets_at = excluded.resets_at",
                params![key, row.count as i64, row.resets_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_capsule(&self, id: &str) -> Result<Option<CapsuleRecord>> {
        let id = id.to_string();
        self.exec(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM capsules WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn put_capsule(&self, record: &CapsuleRecord) -> Result<()> {
        let record = record.clone();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO capsules (id, session_id, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     session_id = excluded.session_id,
                     status = excluded.status,
                     created_at = excluded.created_at,
                     body = excluded.body",
                params![
                    record.id,
                    record.session_id,
                    record.status.as_str(),
                    record.created_at,
                    serde_json::to_string(&record)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn capsules_by_session(&self, session_id: &str) -> Result<Vec<CapsuleRecord>> {
        let session_id = session_id.to_string();
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM capsules WHERE session_id = ?1 ORDER BY created_at DESC",
            )?;
            let bodies = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies
                .into_iter()
                .map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn capsules_by_status(&self, status: CapsuleStatus) -> Result<Vec<CapsuleRecord>> {
        self.exec(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM capsules WHERE status = ?1 ORDER BY created_at DESC",
            )?;
            let bodies = stmt
                .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            bodies
                .into_iter()
                .map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn get_balance(&self, hid: &Hid) -> Result<f64> {
        let hid = hid.as_str().to_string();
        self.exec(move |conn| {
            let amount: Option<f64> = conn
                .query_row(
                    "SELECT amount FROM tvm_balance WHERE hid = ?1",
                    params![hid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(amount.unwrap_or(0.0))
        })
        .await
    }

    async fn credit_balance(&self, hid: &Hid, amount: f64) -> Result<f64> {
        let hid = hid.as_str().to_string();
        self.exec(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO tvm_balance (hid, amount) VALUES (?1, ?2)
                 ON CONFLICT(hid) DO UPDATE SET amount = amount + excluded.amount",
                params![hid, amount],
            )?;
            let new_amount: f64 = tx.query_row(
                "SELECT amount FROM tvm_balance WHERE hid = ?1",
                params![hid],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(new_amount)
        })
        .await
    }
}
