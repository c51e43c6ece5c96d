//! Type-specific payload builders.
//!
//! The validator and the projections rely on these well-known fields;
//! anything else in a payload is opaque to the chain.

use serde_json::{json, Value};

/// Payload for a user chat message.
pub fn chat_user(chat_id: &str, text: &str) -> Value {
    json!({
        "chatId": chat_id,
        "text": text,
        "role": "user",
    })
}

/// Payload for an AI advice message.
pub fn ai_advice(chat_id: &str, text: &str) -> Value {
    json!({
        "chatId": chat_id,
        "text": text,
        "role": "assistant",
    })
}

/// Payload for a business decision (`decision` is e.g. `"ACCEPT"`).
pub fn biz_decision(chat_id: &str, decision: &str, text: Option<&str>) -> Value {
    let mut payload = json!({
        "chatId": chat_id,
        "decision": decision,
    });
    if let Some(text) = text {
        payload["text"] = json!(text);
    }
    payload
}

/// Payload for a business outcome, referencing the decision it resolves.
pub fn biz_outcome(chat_id: &str, outcome: &str, decision_seq: u64) -> Value {
    json!({
        "chatId": chat_id,
        "outcome": outcome,
        "decisionSeq": decision_seq,
    })
}

/// Payload binding a capsule mint to the chain.
pub fn capsule_mint(
    capsule_id: &str,
    session_id: &str,
    rich_score: u32,
    business_score: u32,
    capsule_hash: &str,
) -> Value {
    json!({
        "capsuleId": capsule_id,
        "sessionId": session_id,
        "richScore": rich_score,
        "businessScore": business_score,
        "capsuleHash": capsule_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_payload_fields() {
        let p = chat_user("hakim", "hello");
        assert_eq!(p["chatId"], "hakim");
        assert_eq!(p["role"], "user");

        let p = ai_advice("hakim", "consider wheat");
        assert_eq!(p["role"], "assistant");
    }

    #[test]
    fn test_decision_optional_text() {
        let p = biz_decision("hakim", "ACCEPT", None);
        assert!(p.get("text").is_none());

        let p = biz_decision("hakim", "REJECT", Some("too risky"));
        assert_eq!(p["text"], "too risky");
    }

    #[test]
    fn test_outcome_references_decision() {
        let p = biz_outcome("hakim", "SUCCESS", 7);
        assert_eq!(p["decisionSeq"], 7);
    }

    #[test]
    fn test_mint_payload_fields() {
        let p = capsule_mint("cap-1", "sess-1", 85, 80, "abcd");
        assert_eq!(p["capsuleId"], "cap-1");
        assert_eq!(p["richScore"], 85);
        assert_eq!(p["capsuleHash"], "abcd");
    }
}
