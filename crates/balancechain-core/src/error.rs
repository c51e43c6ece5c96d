//! Error types for BalanceChain core primitives.

use thiserror::Error;

/// Errors from canonicalization, crypto, and segment construction.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("malformed segment: {0}")]
    MalformedSegment(String),

    #[error("invalid segment reference: {0}")]
    InvalidRef(String),

    #[error("invalid HID: {0}")]
    InvalidHid(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("unsupported backup version: {0}")]
    BackupVersionMismatch(u8),

    #[error("backup authentication failed")]
    BackupAuthFailed,

    #[error("encryption error: {0}")]
    EncryptionError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
