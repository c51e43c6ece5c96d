//! Error types for the chain engine.
//!
//! The commit boundary is the only place rule failures become visible to
//! callers: every rejection is a structured [`RuleFailure`] inside
//! [`ChainError::Rejected`], never a panic or an unwound store error.

use thiserror::Error;

use balancechain_core::CoreError;
use balancechain_store::StoreError;

use crate::validator::RuleFailure;

/// Errors surfaced by the chain engine.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A validation rule rejected the segment. The chain is unchanged.
    #[error("{0}")]
    Rejected(#[from] RuleFailure),

    /// The read-only latch is set; commits are refused before validation.
    #[error("read_only_mode: {reason}")]
    ReadOnly { reason: String },

    /// A parallel committer took the target position. Re-read the head and
    /// retry.
    #[error("commit_error: conflicting append, retry with fresh head")]
    CommitConflict,

    /// Storage failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Crypto or encoding failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Identity is missing or unusable.
    #[error("identity error: {0}")]
    Identity(String),

    /// Bad plan id, unsupported provider, or similar caller mistakes.
    #[error("config error: {0}")]
    Config(String),

    /// A capsule mint was refused (wrong status or no longer eligible).
    #[error("capsule not mintable: {0}")]
    NotMintable(String),
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => ChainError::CommitConflict,
            other => ChainError::Store(other),
        }
    }
}

/// Result type for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;
