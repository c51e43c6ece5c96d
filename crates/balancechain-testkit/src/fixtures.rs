//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a manually driven clock, a
//! seeded identity, and a chain over an in-memory store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use balancechain::{ChainConfig, ChainHandle, Clock, Identity};
use balancechain_core::crypto::SIG_ALG;
use balancechain_core::{payload, EcdsaKeypair, Hid, SegmentKind};
use balancechain_store::{IdentityRecord, MemoryStore, Store};

/// 2025-01-14T12:00:00Z, the default fixture epoch.
pub const T0: i64 = 1_736_856_000_000;

/// A clock tests drive by hand.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    /// Move time forward.
    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A ready-made chain over an in-memory store with a manual clock.
pub struct TestFixture {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn Store>,
    pub identity: Arc<Identity>,
    pub chain: ChainHandle,
}

impl TestFixture {
    /// Create a fixture with the default seeded identity.
    pub async fn new() -> Self {
        Self::with_seed([0x42; 32]).await
    }

    /// Create a fixture with a deterministic identity from a seed.
    pub async fn with_seed(seed: [u8; 32]) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));

        seed_identity(store.as_ref(), &seed, T0).await;
        let identity = Arc::new(
            Identity::load_or_create(store.as_ref(), clock.as_ref())
                .await
                .expect("fixture identity"),
        );

        let chain = ChainHandle::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&clock) as Arc<dyn Clock>,
            ChainConfig::default(),
        );

        Self {
            clock,
            store,
            identity,
            chain,
        }
    }

    /// Build a fixture over a caller-provided store (e.g. SQLite on disk).
    pub async fn over_store(store: Arc<dyn Store>, seed: [u8; 32]) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        seed_identity(store.as_ref(), &seed, T0).await;
        let identity = Arc::new(
            Identity::load_or_create(store.as_ref(), clock.as_ref())
                .await
                .expect("fixture identity"),
        );
        let chain = ChainHandle::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&clock) as Arc<dyn Clock>,
            ChainConfig::default(),
        );
        Self {
            clock,
            store,
            identity,
            chain,
        }
    }

    /// The fixture identity's HID.
    pub fn hid(&self) -> Hid {
        self.identity.hid().clone()
    }

    /// Advance past the rate limit and commit a chat message.
    pub async fn commit_chat(
        &self,
        chat_id: &str,
        text: &str,
    ) -> balancechain::Result<balancechain::CommitReceipt> {
        self.clock.advance(1000);
        self.chain
            .commit(SegmentKind::ChatUser, payload::chat_user(chat_id, text))
            .await
    }
}

/// Persist a deterministic identity record so `load_or_create` finds it.
pub async fn seed_identity(store: &dyn Store, seed: &[u8; 32], now_ms: i64) {
    let keypair = EcdsaKeypair::from_seed(seed).expect("fixture seed is a valid scalar");
    let public_key = keypair.public_key();
    let record = IdentityRecord {
        version: 1,
        hid: Hid::derive(&public_key),
        pubkey: public_key.to_base64(),
        alg: SIG_ALG.to_string(),
        private_key: BASE64.encode(keypair.secret_bytes()),
        credential_id: None,
        created_at: now_ms,
    };
    store
        .put_identity(&record)
        .await
        .expect("fixture identity persists");
}

/// Fixtures for multi-device or multi-party tests.
pub async fn multi_party_fixtures(count: usize) -> Vec<TestFixture> {
    let mut fixtures = Vec::with_capacity(count);
    for i in 0..count {
        let mut seed = [0x42u8; 32];
        seed[0] = (i + 1) as u8;
        fixtures.push(TestFixture::with_seed(seed).await);
    }
    fixtures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_deterministic_identity() {
        let a = TestFixture::with_seed([7; 32]).await;
        let b = TestFixture::with_seed([7; 32]).await;
        assert_eq!(a.hid(), b.hid());

        let c = TestFixture::with_seed([8; 32]).await;
        assert_ne!(a.hid(), c.hid());
    }

    #[tokio::test]
    async fn test_commit_chat_respects_rate_limit() {
        let fixture = TestFixture::new().await;
        fixture.commit_chat("hakim", "one").await.unwrap();
        fixture.commit_chat("hakim", "two").await.unwrap();
        assert_eq!(fixture.store.chain_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_multi_party_unique_keys() {
        let parties = multi_party_fixtures(3).await;
        assert_ne!(parties[0].hid(), parties[1].hid());
        assert_ne!(parties[1].hid(), parties[2].hid());
        assert_ne!(parties[0].hid(), parties[2].hid());
    }
}
