//! The chain handle: the single-writer append pipeline.
//!
//! `commit` is the only way a segment enters the chain. The whole
//! read-then-write sequence (read head, compute seq, validate, persist)
//! runs inside one critical section, and the persistence itself is one
//! store transaction, so no parallel committer can interleave between the
//! head read and the head write.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::debug;

use balancechain_core::consts::NONCE_PURGE_AGE_MS;
use balancechain_core::{Hid, SegmentBuilder, SegmentKind, SegmentRef};
use balancechain_store::{CommitBatch, MessageRecord, Store};

use crate::caps::{checked_increment, CapsAccountant};
use crate::clock::Clock;
use crate::error::{ChainError, Result};
use crate::identity::{Identity, LivenessVerifier, StructuralVerifier};
use crate::integrity;
use crate::projection::{message_from_segment, replay, CommitEvent, ScoreState};
use crate::validator::{validate, CapsCounters, ValidationContext, ValidatorOptions};

/// Configuration for a chain handle.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    /// Skip the liveness rule (testing only).
    pub skip_liveness: bool,
}

/// Optional commit inputs beyond kind and payload.
#[derive(Debug, Clone, Default)]
pub struct CommitParams {
    pub previous_owner: Option<Hid>,
    pub unlocker_ref: Option<SegmentRef>,
    pub unlocked_ref: Option<SegmentRef>,
}

/// The result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub seq: u64,
    pub head: String,
    pub id: SegmentRef,
}

/// Handle over one identity's chain.
pub struct ChainHandle {
    store: Arc<dyn Store>,
    identity: Arc<Identity>,
    caps: Arc<CapsAccountant>,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn LivenessVerifier>,
    config: ChainConfig,
    commit_lock: AsyncMutex<()>,
    scores: Mutex<ScoreState>,
    events: broadcast::Sender<CommitEvent>,
}

impl ChainHandle {
    /// Create a handle over a store and identity.
    pub fn new(
        store: Arc<dyn Store>,
        identity: Arc<Identity>,
        clock: Arc<dyn Clock>,
        config: ChainConfig,
    ) -> Self {
        let caps = Arc::new(CapsAccountant::new(Arc::clone(&store), Arc::clone(&clock)));
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            identity,
            caps,
            clock,
            verifier: Arc::new(StructuralVerifier),
            config,
            commit_lock: AsyncMutex::new(()),
            scores: Mutex::new(ScoreState::default()),
            events,
        }
    }

    /// Replace the liveness verifier (platform authenticator integration).
    pub fn with_liveness_verifier(mut self, verifier: Arc<dyn LivenessVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn caps(&self) -> &Arc<CapsAccountant> {
        &self.caps
    }

    /// Subscribe to commit events.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.events.subscribe()
    }

    /// The current in-memory score projection.
    pub fn scores(&self) -> ScoreState {
        self.scores.lock().map(|s| *s).unwrap_or_default()
    }

    /// Append a segment of the given kind.
    pub async fn commit(&self, kind: SegmentKind, payload: Value) -> Result<CommitReceipt> {
        self.commit_with(kind, payload, CommitParams::default())
            .await
    }

    /// Append with transfer or unlock parameters.
    pub async fn commit_with(
        &self,
        kind: SegmentKind,
        payload: Value,
        params: CommitParams,
    ) -> Result<CommitReceipt> {
        let _guard = self.commit_lock.lock().await;

        // The read-only latch short-circuits before the validator runs.
        if let Some(state) = integrity::read_only_state(self.store.as_ref()).await? {
            if state.enabled {
                return Err(ChainError::ReadOnly {
                    reason: state.reason,
                });
            }
        }

        let head = self.store.chain_head().await?;
        let len = self.store.chain_len().await?;
        let now = self.clock.now_ms();

        let mut builder = SegmentBuilder::new(self.identity.author(), head.clone(), len + 1, kind)
            .timestamp(now)
            .payload(payload);
        if let Some(previous_owner) = params.previous_owner {
            builder = builder.previous_owner(previous_owner);
        }
        if let Some(unlocker) = params.unlocker_ref {
            builder = builder.unlocker_ref(unlocker);
        }
        if let Some(unlocked) = params.unlocked_ref {
            builder = builder.unlocked_ref(unlocked);
        }
        let segment = builder.sign_with(|signable| self.identity.sign(signable));

        // Assemble the validation context inside the critical section.
        let prev_segment = if len > 0 {
            self.store.get_segment(len).await?
        } else {
            None
        };
        let caps_state = self.caps.current(self.identity.hid()).await?;
        let ctx = ValidationContext {
            chain_head: head,
            chain_len: len,
            prev_segment,
            nonce_replayed: self.store.has_nonce(&segment.nonce).await?,
            unlocker_exists: self.ref_exists(&segment.unlocker_ref).await?,
            unlocked_exists: self.ref_exists(&segment.unlocked_ref).await?,
            caps: CapsCounters {
                daily: caps_state.daily.count,
                monthly: caps_state.monthly.count,
                yearly: caps_state.yearly.count,
            },
            now_ms: now,
        };

        let opts = ValidatorOptions {
            skip_liveness: self.config.skip_liveness,
            verifier: self.verifier.as_ref(),
        };
        // A rejection leaves no side effect: nothing has been written yet.
        validate(&segment, &ctx, &opts)?;

        let caps_after = if kind.is_cap_affecting() {
            Some(checked_increment(&caps_state, 1)?)
        } else {
            None
        };

        let new_head = segment.block_hash();
        let message = message_from_segment(&segment);
        let seq = segment.seq;
        let id = segment.id();

        let batch = CommitBatch {
            segment: segment.clone(),
            new_head: new_head.clone(),
            message,
            caps: caps_after
                .map(|state| state.rows(self.identity.hid()))
                .unwrap_or_default(),
        };
        self.store.commit_segment(batch).await?;

        // Post-commit bookkeeping: cache, scores, event. The transaction
        // has already committed; readers may observe the new head now.
        if let Some(state) = caps_after {
            self.caps.note_committed(self.identity.hid(), state);
        }
        if let Ok(mut scores) = self.scores.lock() {
            scores.apply(&segment);
        }
        let _ = self.events.send(CommitEvent {
            kind,
            seq,
            head: new_head.clone(),
        });

        debug!(seq, kind = kind.as_str(), head = %new_head, "committed segment");
        Ok(CommitReceipt {
            seq,
            head: new_head,
            id,
        })
    }

    /// Regenerate the message and score projections by replaying the
    /// chain; used on startup and after a restore.
    pub async fn rebuild_projections(&self) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        let len = self.store.chain_len().await?;
        let segments = self.store.get_segments_range(1, len).await?;
        let (messages, scores) = replay(&segments);

        self.store.replace_messages(messages).await?;
        if let Ok(mut current) = self.scores.lock() {
            *current = scores;
        }
        debug!(len, "rebuilt projections");
        Ok(())
    }

    /// The message view for one chat, in chain order.
    pub async fn message_view(&self, peer: &str) -> Result<Vec<MessageRecord>> {
        Ok(self.store.messages_for_peer(peer).await?)
    }

    /// Drop nonce-log entries past the purge age.
    pub async fn purge_stale_nonces(&self) -> Result<u64> {
        let cutoff = self.clock.now_ms() - NONCE_PURGE_AGE_MS;
        Ok(self.store.purge_nonces_before(cutoff).await?)
    }

    async fn ref_exists(&self, raw: &Option<String>) -> Result<bool> {
        let Some(raw) = raw else {
            return Ok(true);
        };
        let Ok(reference) = SegmentRef::parse(raw) else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_segment(reference.seq)
            .await?
            .map(|s| s.nonce == reference.nonce)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::validator::Reason;
    use balancechain_core::consts::GENESIS;
    use balancechain_core::payload;
    use balancechain_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock(AtomicI64);

    impl TestClock {
        fn advance(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    const T0: i64 = 1_736_856_000_000;

    async fn chain() -> (Arc<TestClock>, ChainHandle) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(TestClock(AtomicI64::new(T0)));
        let identity = Arc::new(
            Identity::load_or_create(store.as_ref(), &SystemClock)
                .await
                .unwrap(),
        );
        let handle = ChainHandle::new(
            store,
            identity,
            Arc::clone(&clock) as Arc<dyn Clock>,
            ChainConfig::default(),
        );
        (clock, handle)
    }

    #[tokio::test]
    async fn test_first_commit_is_genesis() {
        let (_clock, chain) = chain().await;

        let receipt = chain
            .commit(
                SegmentKind::ChatUser,
                payload::chat_user("hakim", "hello"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.seq, 1);
        let segment = chain.store().get_segment(1).await.unwrap().unwrap();
        assert_eq!(segment.prev_hash, GENESIS);
        assert_eq!(segment.block_hash(), receipt.head);
        assert_eq!(chain.store().chain_head().await.unwrap(), receipt.head);
    }

    #[tokio::test]
    async fn test_commits_hash_link() {
        let (clock, chain) = chain().await;

        let r1 = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap();
        clock.advance(1000);
        let r2 = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "two"))
            .await
            .unwrap();

        let s2 = chain.store().get_segment(2).await.unwrap().unwrap();
        assert_eq!(s2.prev_hash, r1.head);
        assert_eq!(chain.store().chain_len().await.unwrap(), 2);
        assert_eq!(chain.store().chain_head().await.unwrap(), r2.head);
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_has_no_side_effect() {
        let (clock, chain) = chain().await;

        chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap();
        let head_before = chain.store().chain_head().await.unwrap();

        clock.advance(200);
        let err = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "two"))
            .await
            .unwrap_err();
        match err {
            ChainError::Rejected(failure) => assert_eq!(failure.reason, Reason::RateLimit),
            other => panic!("expected rejection, got {other:?}"),
        }

        assert_eq!(chain.store().chain_len().await.unwrap(), 1);
        assert_eq!(chain.store().chain_head().await.unwrap(), head_before);
    }

    #[tokio::test]
    async fn test_caps_increment_only_for_cap_affecting() {
        let (clock, chain) = chain().await;
        let hid = chain.identity().hid().clone();

        chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap();
        assert_eq!(chain.caps().current(&hid).await.unwrap().daily.count, 1);

        clock.advance(1000);
        chain
            .commit(
                SegmentKind::BizOutcome,
                payload::biz_outcome("c", "SUCCESS", 1),
            )
            .await
            .unwrap();
        // biz.outcome is not cap-affecting
        assert_eq!(chain.caps().current(&hid).await.unwrap().daily.count, 1);
    }

    #[tokio::test]
    async fn test_commit_event_emitted_after_commit() {
        let (_clock, chain) = chain().await;
        let mut events = chain.subscribe();

        let receipt = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.seq, receipt.seq);
        assert_eq!(event.head, receipt.head);
        assert_eq!(event.kind, SegmentKind::ChatUser);
    }

    #[tokio::test]
    async fn test_read_only_latch_blocks_commit() {
        let (_clock, chain) = chain().await;

        integrity::set_read_only(chain.store().as_ref(), "corruption detected", T0)
            .await
            .unwrap();

        let err = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ReadOnly { .. }));
        assert_eq!(chain.store().chain_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transfer_requires_owner_change() {
        let (_clock, chain) = chain().await;

        let err = chain
            .commit_with(
                SegmentKind::TvmTransfer,
                json!({"amount": 1.0}),
                CommitParams {
                    previous_owner: Some(chain.identity().hid().clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            ChainError::Rejected(failure) => assert_eq!(failure.reason, Reason::SameOwner),
            other => panic!("expected rejection, got {other:?}"),
        }

        let receipt = chain
            .commit_with(
                SegmentKind::TvmTransfer,
                json!({"amount": 1.0}),
                CommitParams {
                    previous_owner: Some(Hid::parse("HID-00000000").unwrap()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.seq, 1);
    }

    #[tokio::test]
    async fn test_rebuild_projections_matches_incremental() {
        let (clock, chain) = chain().await;

        chain
            .commit(SegmentKind::ChatUser, payload::chat_user("hakim", "hi"))
            .await
            .unwrap();
        clock.advance(1000);
        chain
            .commit(
                SegmentKind::BizDecision,
                payload::biz_decision("hakim", "ACCEPT", None),
            )
            .await
            .unwrap();

        let incremental_scores = chain.scores();
        let incremental_view = chain.message_view("hakim").await.unwrap();

        chain.rebuild_projections().await.unwrap();

        assert_eq!(chain.scores(), incremental_scores);
        assert_eq!(chain.message_view("hakim").await.unwrap(), incremental_view);
    }

    #[tokio::test]
    async fn test_unlock_refs_validated() {
        let (clock, chain) = chain().await;

        let r1 = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "one"))
            .await
            .unwrap();
        clock.advance(1000);
        let r2 = chain
            .commit(SegmentKind::ChatUser, payload::chat_user("c", "two"))
            .await
            .unwrap();
        clock.advance(1000);

        // unlocker must come after unlocked
        let err = chain
            .commit_with(
                SegmentKind::ChatUser,
                payload::chat_user("c", "three"),
                CommitParams {
                    unlocker_ref: Some(r1.id.clone()),
                    unlocked_ref: Some(r2.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            ChainError::Rejected(failure) => assert_eq!(failure.reason, Reason::CounterOrder),
            other => panic!("expected rejection, got {other:?}"),
        }

        chain
            .commit_with(
                SegmentKind::ChatUser,
                payload::chat_user("c", "three"),
                CommitParams {
                    unlocker_ref: Some(r2.id),
                    unlocked_ref: Some(r1.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}
