//! # BalanceChain Store
//!
//! Durable, transactional storage for BalanceChain.
//!
//! The [`Store`] trait abstracts over the eight persisted collections
//! (meta, state_chain, sync_log, messages, identity, caps, capsules,
//! tvm_balance). Two implementations ship:
//!
//! - [`SqliteStore`] - the primary backend (rusqlite, bundled SQLite,
//!   versioned migrations)
//! - [`MemoryStore`] - for tests and tooling
//!
//! The load-bearing guarantee is [`Store::commit_segment`]: one commit's
//! writes (segment, nonce, message projection, caps counters, head/len)
//! land in a single transaction or not at all.

pub mod error;
pub mod memory;
pub mod migration;
pub mod records;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use records::{
    CapsPeriod, CapsRow, CapsuleRecord, CapsuleStatus, CommitBatch, Direction, IdentityRecord,
    MessageRecord,
};
pub use sqlite::SqliteStore;
pub use traits::{meta_keys, Store, StoreExt, SHADOW_HISTORY_LIMIT};
