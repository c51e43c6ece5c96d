//! # BalanceChain
//!
//! An offline-first, per-identity, append-only signed action ledger.
//!
//! Each identity owns one hash-linked chain of signed segments recording
//! user actions, AI interactions, business decisions, and token mints.
//! The chain is the source of truth; conversations, scores, token
//! balances, and quotas are deterministic projections of it.
//!
//! ## The write path
//!
//! ```text
//! caller -> ChainHandle::commit(kind, payload)
//!        -> SegmentBuilder (seq+1, prev_hash, now, fresh nonce)
//!        -> Identity::sign
//!        -> validator (nine rules, short-circuit)
//!        -> Store::commit_segment (segment + nonce + projection + head, atomic)
//!        -> CommitEvent broadcast
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use balancechain::{ChainConfig, ChainHandle, Identity, SystemClock};
//! use balancechain_core::{payload, SegmentKind};
//! use balancechain_store::{MemoryStore, Store};
//!
//! # async fn demo() -> balancechain::Result<()> {
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let clock = Arc::new(SystemClock);
//! let identity = Arc::new(Identity::load_or_create(store.as_ref(), clock.as_ref()).await?);
//! let chain = ChainHandle::new(store, identity, clock, ChainConfig::default());
//!
//! let receipt = chain
//!     .commit(SegmentKind::ChatUser, payload::chat_user("hakim", "hello"))
//!     .await?;
//! assert_eq!(receipt.seq, 1);
//! # Ok(())
//! # }
//! ```

pub mod boundary;
pub mod caps;
pub mod capsules;
pub mod chain;
pub mod clock;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod projection;
pub mod validator;

pub use caps::{CapsAccountant, CapsAvailable, CapsState};
pub use capsules::{check_eligibility, similarity, CapsuleVault, SessionAnalysis};
pub use chain::{ChainConfig, ChainHandle, CommitParams, CommitReceipt};
pub use clock::{Clock, SystemClock};
pub use error::{ChainError, Result};
pub use identity::{Identity, LivenessProof, LivenessVerifier, StructuralVerifier};
pub use integrity::{
    check_restore, clear_read_only, detect_clone, read_only_state, scan_and_latch, scan_chain,
    CloneReport, ErrorCode, ReadOnlyState, RestoreCheck, ScanIssue, ScanReport, Severity,
};
pub use projection::{theme_for, CommitEvent, ScoreState};
pub use validator::{validate, Reason, RuleFailure, ValidationContext, ValidatorOptions};
