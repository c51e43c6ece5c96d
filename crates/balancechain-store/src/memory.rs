//! In-memory implementation of the Store trait, for tests and tooling.
//!
//! A single `RwLock` over the whole state makes every commit trivially
//! atomic: the write guard is the transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use balancechain_core::consts::GENESIS;
use balancechain_core::{Hid, Segment, SegmentKind};

use crate::error::{Result, StoreError};
use crate::records::{
    CapsPeriod, CapsRow, CapsuleRecord, CapsuleStatus, CommitBatch, IdentityRecord, MessageRecord,
};
use crate::traits::{meta_keys, Store};

#[derive(Default)]
struct Inner {
    meta: HashMap<String, Value>,
    segments: BTreeMap<u64, Segment>,
    nonces: HashMap<String, i64>,
    messages: BTreeMap<String, MessageRecord>,
    identity: Option<IdentityRecord>,
    caps: HashMap<String, CapsRow>,
    capsules: HashMap<String, CapsuleRecord>,
    balances: HashMap<String, f64>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_meta(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &Value) -> Result<()> {
        self.write()?.meta.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        self.write()?.meta.remove(key);
        Ok(())
    }

    async fn chain_head(&self) -> Result<String> {
        Ok(match self.read()?.meta.get(meta_keys::CHAIN_HEAD) {
            Some(Value::String(head)) => head.clone(),
            _ => GENESIS.to_string(),
        })
    }

    async fn chain_len(&self) -> Result<u64> {
        Ok(self
            .read()?
            .meta
            .get(meta_keys::CHAIN_LEN)
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn set_chain_state(&self, head: &str, len: u64) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .meta
            .insert(meta_keys::CHAIN_HEAD.into(), Value::String(head.into()));
        inner
            .meta
            .insert(meta_keys::CHAIN_LEN.into(), Value::from(len));
        Ok(())
    }

    async fn get_segment(&self, seq: u64) -> Result<Option<Segment>> {
        Ok(self.read()?.segments.get(&seq).cloned())
    }

    async fn get_segments_range(&self, start: u64, end: u64) -> Result<Vec<Segment>> {
        Ok(self
            .read()?
            .segments
            .range(start..=end)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn segments_by_kind(&self, kind: SegmentKind) -> Result<Vec<Segment>> {
        Ok(self
            .read()?
            .segments
            .values()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect())
    }

    async fn segment_count(&self) -> Result<u64> {
        Ok(self.read()?.segments.len() as u64)
    }

    async fn put_segment_unchecked(&self, segment: &Segment) -> Result<()> {
        let mut inner = self.write()?;
        inner.nonces.insert(segment.nonce.clone(), segment.ts);
        inner.segments.insert(segment.seq, segment.clone());
        Ok(())
    }

    async fn has_nonce(&self, nonce: &str) -> Result<bool> {
        Ok(self.read()?.nonces.contains_key(nonce))
    }

    async fn purge_nonces_before(&self, cutoff_ts: i64) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.nonces.len();
        inner.nonces.retain(|_, ts| *ts >= cutoff_ts);
        Ok((before - inner.nonces.len()) as u64)
    }

    async fn commit_segment(&self, batch: CommitBatch) -> Result<()> {
        let mut inner = self.write()?;
        let seq = batch.segment.seq;

        if inner.segments.contains_key(&seq) || inner.nonces.contains_key(&batch.segment.nonce) {
            return Err(StoreError::Conflict { seq });
        }

        inner.nonces.insert(batch.segment.nonce.clone(), batch.segment.ts);
        inner.segments.insert(seq, batch.segment);

        if let Some(message) = batch.message {
            inner.messages.insert(message.id.clone(), message);
        }

        for (period, hid, row) in batch.caps {
            inner.caps.insert(period.key(&hid), row);
        }

        inner
            .meta
            .insert(meta_keys::CHAIN_HEAD.into(), Value::String(batch.new_head));
        inner
            .meta
            .insert(meta_keys::CHAIN_LEN.into(), Value::from(seq));
        Ok(())
    }

    async fn messages_for_peer(&self, peer: &str) -> Result<Vec<MessageRecord>> {
        let mut messages: Vec<MessageRecord> = self
            .read()?
            .messages
            .values()
            .filter(|m| m.peer == peer)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    async fn replace_messages(&self, messages: Vec<MessageRecord>) -> Result<()> {
        let mut inner = self.write()?;
        inner.messages.clear();
        for message in messages {
            inner.messages.insert(message.id.clone(), message);
        }
        Ok(())
    }

    async fn get_identity(&self) -> Result<Option<IdentityRecord>> {
        Ok(self.read()?.identity.clone())
    }

    async fn put_identity(&self, record: &IdentityRecord) -> Result<()> {
        self.write()?.identity = Some(record.clone());
        Ok(())
    }

    async fn get_caps_row(&self, period: CapsPeriod, hid: &Hid) -> Result<Option<CapsRow>> {
        Ok(self.read()?.caps.get(&period.key(hid)).copied())
    }

    async fn put_caps_row(&self, period: CapsPeriod, hid: &Hid, row: &CapsRow) -> Result<()> {
        self.write()?.caps.insert(period.key(hid), *row);
        Ok(())
    }

    async fn get_capsule(&self, id: &str) -> Result<Option<CapsuleRecord>> {
        Ok(self.read()?.capsules.get(id).cloned())
    }

    async fn put_capsule(&self, record: &CapsuleRecord) -> Result<()> {
        self.write()?
            .capsules
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn capsules_by_session(&self, session_id: &str) -> Result<Vec<CapsuleRecord>> {
        let mut capsules: Vec<CapsuleRecord> = self
            .read()?
            .capsules
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        capsules.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(capsules)
    }

    async fn capsules_by_status(&self, status: CapsuleStatus) -> Result<Vec<CapsuleRecord>> {
        let mut capsules: Vec<CapsuleRecord> = self
            .read()?
            .capsules
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        capsules.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(capsules)
    }

    async fn get_balance(&self, hid: &Hid) -> Result<f64> {
        Ok(self
            .read()?
            .balances
            .get(hid.as_str())
            .copied()
            .unwrap_or(0.0))
    }

    async fn credit_balance(&self, hid: &Hid, amount: f64) -> Result<f64> {
        let mut inner = self.write()?;
        let balance = inner.balances.entry(hid.as_str().to_string()).or_insert(0.0);
        *balance += amount;
        Ok(*balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancechain_core::{payload, Author, EcdsaKeypair, SegmentBuilder};

    fn make_segment(seq: u64) -> Segment {
        let keypair = EcdsaKeypair::from_seed(&[0x42; 32]).unwrap();
        let author = Author::from_keypair(&keypair);
        SegmentBuilder::new(author, GENESIS, seq, SegmentKind::ChatUser)
            .timestamp(1000 * seq as i64)
            .payload(payload::chat_user("hakim", "hello"))
            .sign(&keypair)
    }

    #[tokio::test]
    async fn test_commit_is_atomic_on_conflict() {
        let store = MemoryStore::new();
        let s1 = make_segment(1);
        let s2 = make_segment(1);

        store
            .commit_segment(CommitBatch {
                segment: s1.clone(),
                new_head: s1.block_hash(),
                message: None,
                caps: Vec::new(),
            })
            .await
            .unwrap();

        let result = store
            .commit_segment(CommitBatch {
                segment: s2.clone(),
                new_head: s2.block_hash(),
                message: None,
                caps: Vec::new(),
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { seq: 1 })));
        assert_eq!(store.chain_head().await.unwrap(), s1.block_hash());
        assert!(!store.has_nonce(&s2.nonce).await.unwrap());
    }

    #[tokio::test]
    async fn test_range_query_ordered() {
        let store = MemoryStore::new();
        for seq in [3u64, 1, 2] {
            store.put_segment_unchecked(&make_segment(seq)).await.unwrap();
        }
        let range = store.get_segments_range(1, 3).await.unwrap();
        let seqs: Vec<u64> = range.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
