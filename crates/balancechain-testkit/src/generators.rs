//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

use balancechain_core::{Author, EcdsaKeypair, Segment, SegmentBuilder, SegmentKind};

/// Generate a keypair from an arbitrary non-degenerate seed.
pub fn keypair() -> impl Strategy<Value = EcdsaKeypair> {
    any::<[u8; 32]>()
        .prop_filter_map("seed must be a valid P-256 scalar", |seed| {
            EcdsaKeypair::from_seed(&seed).ok()
        })
}

/// Generate a segment kind.
pub fn segment_kind() -> impl Strategy<Value = SegmentKind> {
    prop::sample::select(SegmentKind::all().to_vec())
}

/// Generate a chat-ish payload object.
pub fn chat_payload() -> impl Strategy<Value = Value> {
    ("[a-z]{1,12}", "[ -~]{0,64}").prop_map(|(chat_id, text)| {
        json!({"chatId": chat_id, "text": text, "role": "user"})
    })
}

/// Generate an arbitrary shallow JSON object payload.
pub fn object_payload() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-zA-Z][a-zA-Z0-9]{0,10}", json_scalar(), 0..6)
        .prop_map(|map| Value::Object(map.into_iter().collect()))
}

fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,24}".prop_map(Value::String),
    ]
}

/// Parameters for generating a signed segment.
#[derive(Debug, Clone)]
pub struct SegmentParams {
    pub seed: [u8; 32],
    pub seq: u64,
    pub ts: i64,
    pub kind: SegmentKind,
    pub prev_hash: String,
    pub payload: Value,
}

impl Arbitrary for SegmentParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            any::<[u8; 32]>().prop_filter("valid scalar", |s| EcdsaKeypair::from_seed(s).is_ok()),
            1u64..=100_000u64,
            0i64..=1_800_000_000_000i64,
            segment_kind(),
            "[0-9a-f]{64}",
            object_payload(),
        )
            .prop_map(|(seed, seq, ts, kind, prev_hash, payload)| SegmentParams {
                seed,
                seq,
                ts,
                kind,
                prev_hash,
                payload,
            })
            .boxed()
    }
}

/// Build a signed segment from parameters (nonce fixed for determinism).
pub fn segment_from_params(params: &SegmentParams) -> Segment {
    let keypair = EcdsaKeypair::from_seed(&params.seed).expect("params carry a valid scalar");
    SegmentBuilder::new(
        Author::from_keypair(&keypair),
        params.prev_hash.clone(),
        params.seq,
        params.kind,
    )
    .timestamp(params.ts)
    .nonce("00112233445566778899aabbccddeeff")
    .payload(params.payload.clone())
    .sign(&keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancechain_core::canonical_json;

    proptest! {
        #[test]
        fn test_block_hash_deterministic(params: SegmentParams) {
            let s1 = segment_from_params(&params);
            let s2 = segment_from_params(&params);

            prop_assert_eq!(s1.signable(), s2.signable());
            prop_assert_eq!(s1.block_hash(), s2.block_hash());
        }

        #[test]
        fn test_signature_always_verifies(params: SegmentParams) {
            let segment = segment_from_params(&params);
            prop_assert!(segment.verify_signature().is_ok());
        }

        #[test]
        fn test_canonical_roundtrip_stable(payload in object_payload()) {
            // canonical(parse(canonical(x))) == canonical(x)
            let first = canonical_json(&payload);
            let reparsed: Value = serde_json::from_str(&first).unwrap();
            prop_assert_eq!(canonical_json(&reparsed), first);
        }

        #[test]
        fn test_segment_json_roundtrip(params: SegmentParams) {
            let segment = segment_from_params(&params);
            let decoded = Segment::from_json(&segment.to_canonical_json()).unwrap();
            prop_assert_eq!(decoded.block_hash(), segment.block_hash());
            prop_assert_eq!(decoded, segment);
        }

        #[test]
        fn test_different_payloads_different_hashes(
            mut params: SegmentParams,
            other in object_payload(),
        ) {
            prop_assume!(params.payload != other);
            let s1 = segment_from_params(&params);
            params.payload = other;
            let s2 = segment_from_params(&params);
            prop_assert_ne!(s1.block_hash(), s2.block_hash());
        }
    }
}
