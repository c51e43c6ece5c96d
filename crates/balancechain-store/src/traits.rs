//! Store trait: the abstract interface for chain persistence.
//!
//! This trait keeps the engine storage-agnostic. Implementations include
//! SQLite (primary) and in-memory (for tests).
//!
//! # Design Notes
//!
//! - **Atomic commits**: [`Store::commit_segment`] applies the segment, its
//!   nonce, the optional message projection, the caps counters, and the
//!   meta head/len in one transaction; readers never observe a torn write.
//! - **Conflicts**: a second writer landing on the same seq gets
//!   [`crate::StoreError::Conflict`] and retries after re-reading the head.
//! - **Unchecked puts**: restore and peer-sync ingestion bypass the commit
//!   gate via [`Store::put_segment_unchecked`]; the integrity scanner is
//!   the safety net for those paths.

use async_trait::async_trait;
use serde_json::Value;

use balancechain_core::{Hid, Segment, SegmentKind};

use crate::error::Result;
use crate::records::{
    CapsPeriod, CapsRow, CapsuleRecord, CapsuleStatus, CommitBatch, IdentityRecord, MessageRecord,
};

/// Meta keys with fixed semantics.
pub mod meta_keys {
    pub const CHAIN_HEAD: &str = "chain_head";
    pub const CHAIN_LEN: &str = "chain_len";
    pub const READ_ONLY: &str = "read_only";
    pub const SHADOW_HISTORY: &str = "shadow:history";

    pub fn subscription(hid: &str) -> String {
        format!("subscription:{hid}")
    }

    pub fn payment(id: &str) -> String {
        format!("payment:{id}")
    }

    pub fn payments(hid: &str) -> String {
        format!("payments:{hid}")
    }
}

/// Maximum entries retained in `shadow:history`.
pub const SHADOW_HISTORY_LIMIT: usize = 100;

/// The Store trait: async interface over the eight collections.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────
    // Meta
    // ─────────────────────────────────────────────────────────────────────

    /// Read a meta value.
    async fn get_meta(&self, key: &str) -> Result<Option<Value>>;

    /// Write a meta value.
    async fn set_meta(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove a meta value.
    async fn delete_meta(&self, key: &str) -> Result<()>;

    /// Current chain head hash (`"GENESIS"` when empty).
    async fn chain_head(&self) -> Result<String>;

    /// Current chain length (0 when empty).
    async fn chain_len(&self) -> Result<u64>;

    /// Overwrite head and length together (restore path only; commits go
    /// through [`Store::commit_segment`]).
    async fn set_chain_state(&self, head: &str, len: u64) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Segments
    // ─────────────────────────────────────────────────────────────────────

    /// Get the segment at a position.
    async fn get_segment(&self, seq: u64) -> Result<Option<Segment>>;

    /// Get segments with `start <= seq <= end`, ordered by seq.
    async fn get_segments_range(&self, start: u64, end: u64) -> Result<Vec<Segment>>;

    /// Get all segments of a kind, ordered by seq.
    async fn segments_by_kind(&self, kind: SegmentKind) -> Result<Vec<Segment>>;

    /// Number of stored segments.
    async fn segment_count(&self) -> Result<u64>;

    /// Upsert a segment without validation or meta updates.
    async fn put_segment_unchecked(&self, segment: &Segment) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Nonce log
    // ─────────────────────────────────────────────────────────────────────

    /// Whether a nonce is already logged.
    async fn has_nonce(&self, nonce: &str) -> Result<bool>;

    /// Drop nonce entries older than the cutoff; returns how many.
    async fn purge_nonces_before(&self, cutoff_ts: i64) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────────────────

    /// Apply one commit atomically: segment + nonce + optional message +
    /// caps rows + meta head/len. All-or-nothing.
    async fn commit_segment(&self, batch: CommitBatch) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Messages for one chat, ordered by seq.
    async fn messages_for_peer(&self, peer: &str) -> Result<Vec<MessageRecord>>;

    /// Replace the whole projection (projection rebuild).
    async fn replace_messages(&self, messages: Vec<MessageRecord>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    async fn get_identity(&self) -> Result<Option<IdentityRecord>>;

    async fn put_identity(&self, record: &IdentityRecord) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Caps
    // ─────────────────────────────────────────────────────────────────────

    async fn get_caps_row(&self, period: CapsPeriod, hid: &Hid) -> Result<Option<CapsRow>>;

    async fn put_caps_row(&self, period: CapsPeriod, hid: &Hid, row: &CapsRow) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Capsules
    // ─────────────────────────────────────────────────────────────────────

    async fn get_capsule(&self, id: &str) -> Result<Option<CapsuleRecord>>;

    async fn put_capsule(&self, record: &CapsuleRecord) -> Result<()>;

    /// Capsules minted from one session, newest first.
    async fn capsules_by_session(&self, session_id: &str) -> Result<Vec<CapsuleRecord>>;

    /// Capsules with a given status, newest first.
    async fn capsules_by_status(&self, status: CapsuleStatus) -> Result<Vec<CapsuleRecord>>;

    // ─────────────────────────────────────────────────────────────────────
    // TVM balance
    // ─────────────────────────────────────────────────────────────────────

    /// Current balance (0.0 when absent).
    async fn get_balance(&self, hid: &Hid) -> Result<f64>;

    /// Add to the balance and return the new value. The only mutation the
    /// balance collection permits.
    async fn credit_balance(&self, hid: &Hid, amount: f64) -> Result<f64>;
}

/// Extension helpers shared by all store implementations.
#[async_trait]
pub trait StoreExt: Store {
    /// Append an entry to the bounded `shadow:history` trail.
    async fn push_shadow_history(&self, entry: Value) -> Result<()> {
        let mut history = match self.get_meta(meta_keys::SHADOW_HISTORY).await? {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        history.push(entry);
        if history.len() > SHADOW_HISTORY_LIMIT {
            let excess = history.len() - SHADOW_HISTORY_LIMIT;
            history.drain(..excess);
        }
        self.set_meta(meta_keys::SHADOW_HISTORY, &Value::Array(history))
            .await
    }
}

#[async_trait]
impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_shadow_history_bounded() {
        let store = MemoryStore::new();

        for i in 0..(SHADOW_HISTORY_LIMIT + 20) {
            store
                .push_shadow_history(json!({"event": i}))
                .await
                .unwrap();
        }

        let history = store
            .get_meta(meta_keys::SHADOW_HISTORY)
            .await
            .unwrap()
            .unwrap();
        let items = history.as_array().unwrap();
        assert_eq!(items.len(), SHADOW_HISTORY_LIMIT);
        // Oldest entries were dropped
        assert_eq!(items[0]["event"], 20);
        assert_eq!(items[SHADOW_HISTORY_LIMIT - 1]["event"], SHADOW_HISTORY_LIMIT + 19);
    }

    #[test]
    fn test_meta_key_builders() {
        assert_eq!(meta_keys::subscription("HID-1"), "subscription:HID-1");
        assert_eq!(meta_keys::payment("pay-1"), "payment:pay-1");
        assert_eq!(meta_keys::payments("HID-1"), "payments:HID-1");
    }
}
