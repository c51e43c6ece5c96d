//! Strong identifier types.
//!
//! Identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{PublicKey, Sha256Hash};
use crate::error::{CoreError, Result};

/// A stable public identity: `HID-` plus the first 8 hex chars (uppercase)
/// of the SHA-256 over the portable public-key encoding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hid(String);

impl Hid {
    /// Derive the HID from a public key.
    pub fn derive(public_key: &PublicKey) -> Self {
        let digest = Sha256Hash::hash(public_key.to_base64().as_bytes());
        Self(format!("HID-{}", &digest.to_hex()[..8].to_uppercase()))
    }

    /// Parse from a string, validating the prefix.
    pub fn parse(s: &str) -> Result<Self> {
        if !s.starts_with("HID-") {
            return Err(CoreError::InvalidHid(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hid({})", self.0)
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Hid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A reference to a segment by position and nonce: `"{seq}:{nonce}"`.
///
/// Used as the message-projection id and as the unlocker/unlocked refs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    pub seq: u64,
    pub nonce: String,
}

impl SegmentRef {
    pub fn new(seq: u64, nonce: impl Into<String>) -> Self {
        Self {
            seq,
            nonce: nonce.into(),
        }
    }

    /// Parse a `"{seq}:{nonce}"` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (seq_part, nonce) = s
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidRef(s.to_string()))?;
        let seq: u64 = seq_part
            .parse()
            .map_err(|_| CoreError::InvalidRef(s.to_string()))?;
        if nonce.is_empty() {
            return Err(CoreError::InvalidRef(s.to_string()));
        }
        Ok(Self {
            seq,
            nonce: nonce.to_string(),
        })
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seq, self.nonce)
    }
}

impl fmt::Debug for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentRef({self})")
    }
}
