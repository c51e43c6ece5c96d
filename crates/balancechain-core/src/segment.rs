//! Segment: the chain's atomic record.
//!
//! A segment is an immutable, signed state transition. Once appended it is
//! never edited; corrections are new segments. The canonical JSON encoding
//! of a segment minus its signature is the signable view; the block hash
//! binds the signable view and the signature together:
//!
//! ```text
//! block_hash = sha256_hex(canonical(signable) || "|" || signature_b64)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_json;
use crate::consts::{GENESIS, PROTOCOL_VERSION};
use crate::crypto::{generate_nonce, sha256_hex, EcdsaKeypair, PublicKey, Signature, SIG_ALG};
use crate::error::{CoreError, Result};
use crate::types::{Hid, SegmentRef};

/// The closed set of segment types.
///
/// The string forms are wire format and consensus-significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    #[serde(rename = "chat.user")]
    ChatUser,
    #[serde(rename = "ai.advice")]
    AiAdvice,
    #[serde(rename = "biz.decision")]
    BizDecision,
    #[serde(rename = "biz.outcome")]
    BizOutcome,
    #[serde(rename = "capsule.mint")]
    CapsuleMint,
    #[serde(rename = "tvm.transfer")]
    TvmTransfer,
    #[serde(rename = "chat.append-legacy")]
    ChatAppendLegacy,
}

impl SegmentKind {
    /// The wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatUser => "chat.user",
            Self::AiAdvice => "ai.advice",
            Self::BizDecision => "biz.decision",
            Self::BizOutcome => "biz.outcome",
            Self::CapsuleMint => "capsule.mint",
            Self::TvmTransfer => "tvm.transfer",
            Self::ChatAppendLegacy => "chat.append-legacy",
        }
    }

    /// Parse a wire string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chat.user" => Some(Self::ChatUser),
            "ai.advice" => Some(Self::AiAdvice),
            "biz.decision" => Some(Self::BizDecision),
            "biz.outcome" => Some(Self::BizOutcome),
            "capsule.mint" => Some(Self::CapsuleMint),
            "tvm.transfer" => Some(Self::TvmTransfer),
            "chat.append-legacy" => Some(Self::ChatAppendLegacy),
            _ => None,
        }
    }

    /// Kinds that count against the daily/monthly/yearly caps.
    pub fn is_cap_affecting(self) -> bool {
        matches!(
            self,
            Self::ChatUser | Self::AiAdvice | Self::BizDecision | Self::CapsuleMint
        )
    }

    /// Kinds projected into the per-chat message view.
    pub fn is_message_bearing(self) -> bool {
        matches!(
            self,
            Self::ChatUser
                | Self::AiAdvice
                | Self::BizDecision
                | Self::BizOutcome
                | Self::ChatAppendLegacy
        )
    }

    /// Kinds requiring a previous-owner transition.
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::TvmTransfer)
    }

    /// All kinds, in wire order.
    pub fn all() -> [SegmentKind; 7] {
        [
            Self::ChatUser,
            Self::AiAdvice,
            Self::BizDecision,
            Self::BizOutcome,
            Self::CapsuleMint,
            Self::TvmTransfer,
            Self::ChatAppendLegacy,
        ]
    }
}

/// The author record carried in every segment: enough to verify the
/// signature without any external lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// The author's stable identity.
    pub hid: Hid,
    /// Portable public key (base64 SEC1 uncompressed point).
    pub pubkey: String,
    /// Signature algorithm tag.
    pub alg: String,
}

impl Author {
    /// Build the author record for a keypair.
    pub fn from_keypair(keypair: &EcdsaKeypair) -> Self {
        let public_key = keypair.public_key();
        Self {
            hid: Hid::derive(&public_key),
            pubkey: public_key.to_base64(),
            alg: SIG_ALG.to_string(),
        }
    }

    /// Decode the portable public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_base64(&self.pubkey)
    }
}

/// A complete, signed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub version: u32,
    pub seq: u64,
    pub ts: i64,
    pub nonce: String,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    pub payload: Value,
    pub prev_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocker_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_owner: Option<Hid>,
    pub current_owner: Hid,
    pub author: Author,
    pub signature: String,
}

impl Segment {
    /// The segment's projection id: `"{seq}:{nonce}"`.
    pub fn id(&self) -> SegmentRef {
        SegmentRef::new(self.seq, self.nonce.clone())
    }

    /// The signable view: canonical JSON of every field except `signature`.
    pub fn signable(&self) -> String {
        let mut value = serde_json::to_value(self).expect("segment serialization is infallible");
        value
            .as_object_mut()
            .expect("segment serializes to an object")
            .remove("signature");
        canonical_json(&value)
    }

    /// The block hash: `sha256_hex(signable || "|" || signature_b64)`.
    ///
    /// This is the value the next segment's `prev_hash` and the stored
    /// `chain_head` must carry.
    pub fn block_hash(&self) -> String {
        let mut input = self.signable().into_bytes();
        input.push(b'|');
        input.extend_from_slice(self.signature.as_bytes());
        sha256_hex(&input)
    }

    /// Verify the signature against the declared author key.
    pub fn verify_signature(&self) -> Result<()> {
        let public_key = self.author.public_key()?;
        let signature = Signature::from_base64(&self.signature)?;
        public_key.verify(self.signable().as_bytes(), &signature)
    }

    /// Parse a segment from its canonical (or any) JSON form.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| CoreError::DecodingError(e.to_string()))
    }

    /// Canonical JSON of the full segment, the stored wire form.
    pub fn to_canonical_json(&self) -> String {
        let value = serde_json::to_value(self).expect("segment serialization is infallible");
        canonical_json(&value)
    }
}

/// Structural pre-filter run before the full validation gate.
pub fn validate_structure(segment: &Segment) -> Result<()> {
    if segment.version < 1 {
        return Err(CoreError::MalformedSegment("version must be >= 1".into()));
    }
    if segment.seq < 1 {
        return Err(CoreError::MalformedSegment("seq must be >= 1".into()));
    }
    if segment.ts < 0 {
        return Err(CoreError::MalformedSegment("timestamp must be >= 0".into()));
    }
    if segment.nonce.len() != 32 || !segment.nonce.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::MalformedSegment("nonce must be 32 hex chars".into()));
    }
    if !segment.payload.is_object() {
        return Err(CoreError::MalformedSegment("payload must be an object".into()));
    }
    if segment.prev_hash.is_empty() {
        return Err(CoreError::MalformedSegment("prev_hash missing".into()));
    }
    if !segment.current_owner.as_str().starts_with("HID-") {
        return Err(CoreError::MalformedSegment(
            "current_owner must be a HID".into(),
        ));
    }
    if !segment.author.hid.as_str().starts_with("HID-") || segment.author.pubkey.is_empty() {
        return Err(CoreError::MalformedSegment("author record incomplete".into()));
    }
    if segment.signature.is_empty() {
        return Err(CoreError::MalformedSegment("signature missing".into()));
    }
    Ok(())
}

/// Builder for constructing and signing segments.
pub struct SegmentBuilder {
    author: Author,
    prev_hash: String,
    seq: u64,
    ts: i64,
    nonce: String,
    kind: SegmentKind,
    payload: Value,
    unlocker_ref: Option<String>,
    unlocked_ref: Option<String>,
    previous_owner: Option<Hid>,
}

impl SegmentBuilder {
    /// Start building a segment at the given position.
    ///
    /// A fresh 16-byte nonce is generated; the timestamp must be supplied
    /// by the caller's clock before signing.
    pub fn new(author: Author, prev_hash: impl Into<String>, seq: u64, kind: SegmentKind) -> Self {
        Self {
            author,
            prev_hash: prev_hash.into(),
            seq,
            ts: 0,
            nonce: generate_nonce(),
            kind,
            payload: Value::Object(Default::default()),
            unlocker_ref: None,
            unlocked_ref: None,
            previous_owner: None,
        }
    }

    /// Builder for the first segment of a chain.
    pub fn genesis(author: Author, kind: SegmentKind) -> Self {
        Self::new(author, GENESIS, 1, kind)
    }

    pub fn timestamp(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }

    /// Override the generated nonce (restore and test paths only).
    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = nonce.into();
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn unlocker_ref(mut self, r: SegmentRef) -> Self {
        self.unlocker_ref = Some(r.to_string());
        self
    }

    pub fn unlocked_ref(mut self, r: SegmentRef) -> Self {
        self.unlocked_ref = Some(r.to_string());
        self
    }

    pub fn previous_owner(mut self, hid: Hid) -> Self {
        self.previous_owner = Some(hid);
        self
    }

    /// Sign and produce the complete segment.
    ///
    /// The signature covers the canonical encoding of every field except
    /// `signature` itself.
    pub fn sign(self, keypair: &EcdsaKeypair) -> Segment {
        self.sign_with(|signable| keypair.sign(signable))
    }

    /// Sign through an external signer, for callers that hold the key
    /// behind a narrow signing interface.
    pub fn sign_with(self, signer: impl FnOnce(&[u8]) -> crate::crypto::Signature) -> Segment {
        let current_owner = self.author.hid.clone();
        let mut segment = Segment {
            version: PROTOCOL_VERSION,
            seq: self.seq,
            ts: self.ts,
            nonce: self.nonce,
            kind: self.kind,
            payload: self.payload,
            prev_hash: self.prev_hash,
            unlocker_ref: self.unlocker_ref,
            unlocked_ref: self.unlocked_ref,
            previous_owner: self.previous_owner,
            current_owner,
            author: self.author,
            signature: String::new(),
        };
        let signature = signer(segment.signable().as_bytes());
        segment.signature = signature.to_base64();
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    fn test_keypair() -> EcdsaKeypair {
        EcdsaKeypair::from_seed(&[0x42; 32]).unwrap()
    }

    fn build_segment(keypair: &EcdsaKeypair) -> Segment {
        let author = Author::from_keypair(keypair);
        SegmentBuilder::genesis(author, SegmentKind::ChatUser)
            .timestamp(1736870400000)
            .payload(payload::chat_user("hakim", "hello"))
            .sign(keypair)
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in SegmentKind::all() {
            assert_eq!(SegmentKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(SegmentKind::from_str("chat.unknown"), None);
    }

    #[test]
    fn test_cap_affecting_set() {
        assert!(SegmentKind::ChatUser.is_cap_affecting());
        assert!(SegmentKind::AiAdvice.is_cap_affecting());
        assert!(SegmentKind::BizDecision.is_cap_affecting());
        assert!(SegmentKind::CapsuleMint.is_cap_affecting());
        assert!(!SegmentKind::BizOutcome.is_cap_affecting());
        assert!(!SegmentKind::TvmTransfer.is_cap_affecting());
    }

    #[test]
    fn test_signable_excludes_signature() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);

        assert!(!segment.signable().contains("signature"));
        assert!(segment.to_canonical_json().contains("signature"));
    }

    #[test]
    fn test_signature_verifies() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);
        segment.verify_signature().unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let keypair = test_keypair();
        let mut segment = build_segment(&keypair);
        segment.payload = payload::chat_user("hakim", "tampered");
        assert!(segment.verify_signature().is_err());
    }

    #[test]
    fn test_block_hash_deterministic() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);
        assert_eq!(segment.block_hash(), segment.block_hash());
        assert_eq!(segment.block_hash().len(), 64);
    }

    #[test]
    fn test_canonical_json_roundtrip() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);

        let json = segment.to_canonical_json();
        let decoded = Segment::from_json(&json).unwrap();
        assert_eq!(segment, decoded);
        assert_eq!(decoded.block_hash(), segment.block_hash());
    }

    #[test]
    fn test_absent_optionals_omitted() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);
        let json = segment.to_canonical_json();
        assert!(!json.contains("unlocker_ref"));
        assert!(!json.contains("previous_owner"));
    }

    #[test]
    fn test_structure_valid_segment_passes() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);
        validate_structure(&segment).unwrap();
    }

    #[test]
    fn test_structure_rejects_bad_nonce() {
        let keypair = test_keypair();
        let mut segment = build_segment(&keypair);
        segment.nonce = "short".into();
        assert!(validate_structure(&segment).is_err());
    }

    #[test]
    fn test_structure_rejects_non_object_payload() {
        let keypair = test_keypair();
        let mut segment = build_segment(&keypair);
        segment.payload = serde_json::json!("just a string");
        assert!(validate_structure(&segment).is_err());
    }

    #[test]
    fn test_structure_rejects_bad_owner() {
        let keypair = test_keypair();
        let segment = build_segment(&keypair);
        let mut json: serde_json::Value = serde_json::to_value(&segment).unwrap();
        json["current_owner"] = serde_json::json!("not-a-hid");
        let bad: Segment = serde_json::from_value(json).unwrap();
        assert!(validate_structure(&bad).is_err());
    }

    #[test]
    fn test_transfer_builder_carries_previous_owner() {
        let keypair = test_keypair();
        let author = Author::from_keypair(&keypair);
        let other = Hid::parse("HID-00000000").unwrap();

        let segment = SegmentBuilder::new(author, "somehash", 2, SegmentKind::TvmTransfer)
            .timestamp(1736870400000)
            .previous_owner(other.clone())
            .sign(&keypair);

        assert_eq!(segment.previous_owner, Some(other));
        assert!(segment.to_canonical_json().contains("previous_owner"));
    }
}
