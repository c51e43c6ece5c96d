//! # BalanceChain Core
//!
//! Pure primitives for the BalanceChain ledger: segments, canonical
//! encoding, and cryptography.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over signed data structures.
//!
//! ## Key Types
//!
//! - [`Segment`] - The atomic signed state transition
//! - [`SegmentKind`] - The closed set of segment types
//! - [`Hid`] - Stable public identity derived from the author key
//! - [`SegmentRef`] - `"{seq}:{nonce}"` reference to a segment
//!
//! ## Canonicalization
//!
//! Segments are encoded as canonical JSON (keys sorted at every depth).
//! The block hash binds the signable view and the signature:
//! `sha256_hex(canonical(signable) || "|" || signature_b64)`.

pub mod backup;
pub mod canonical;
pub mod consts;
pub mod crypto;
pub mod error;
pub mod payload;
pub mod segment;
pub mod types;

pub use backup::{decrypt_backup, encrypt_backup};
pub use canonical::{canonical_bytes, canonical_json};
pub use crypto::{
    generate_nonce, sha256_hex, EcdsaKeypair, PublicKey, SessionKey, Sha256Hash, Signature,
};
pub use error::{CoreError, Result};
pub use segment::{validate_structure, Author, Segment, SegmentBuilder, SegmentKind};
pub use types::{Hid, SegmentRef};
