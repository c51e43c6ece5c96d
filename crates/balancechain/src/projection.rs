//! Deterministic projections of the chain: the per-chat message view and
//! the score state.
//!
//! Projections are pure functions of the segment sequence. The chain
//! applies them incrementally on commit and can regenerate them from
//! scratch by replay; both paths must agree.

use serde_json::Value;

use balancechain_core::{Segment, SegmentKind};
use balancechain_store::{Direction, MessageRecord};

/// A commit notification: emitted strictly after the transaction commits.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub kind: SegmentKind,
    pub seq: u64,
    pub head: String,
}

/// The in-memory score projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreState {
    pub rich: u32,
    pub business: u32,
}

impl ScoreState {
    /// Apply one segment's score effect.
    ///
    /// `biz.decision` with `decision = ACCEPT` raises rich by 2;
    /// `biz.outcome` with `outcome = SUCCESS` raises rich by 5 and
    /// business by 3; an explicit `scores` payload field overrides both.
    /// Everything clips to [0, 100].
    pub fn apply(&mut self, segment: &Segment) {
        match segment.kind {
            SegmentKind::BizDecision => {
                if segment.payload.get("decision").and_then(Value::as_str) == Some("ACCEPT") {
                    self.rich = clip(self.rich + 2);
                }
            }
            SegmentKind::BizOutcome => {
                if segment.payload.get("outcome").and_then(Value::as_str) == Some("SUCCESS") {
                    self.rich = clip(self.rich + 5);
                    self.business = clip(self.business + 3);
                }
            }
            _ => {}
        }

        if let Some(scores) = segment.payload.get("scores") {
            if let Some(rich) = scores.get("richScore").and_then(Value::as_u64) {
                self.rich = clip(rich as u32);
            }
            if let Some(business) = scores.get("businessScore").and_then(Value::as_u64) {
                self.business = clip(business as u32);
            }
        }
    }

    /// The theme band the rich score falls in.
    pub fn theme(&self) -> &'static str {
        theme_for(self.rich)
    }
}

fn clip(value: u32) -> u32 {
    value.min(100)
}

/// Theme band for a rich score: coal, ember, bronze, or gold.
pub fn theme_for(rich: u32) -> &'static str {
    for (name, lower, upper) in balancechain_core::consts::THEME_BANDS {
        if rich >= lower && rich < upper {
            return name;
        }
    }
    // A score of exactly 100 sits in the top band.
    "gold"
}

/// Project a message-bearing segment into its message record.
///
/// Returns `None` for kinds outside the message view.
pub fn message_from_segment(segment: &Segment) -> Option<MessageRecord> {
    if !segment.kind.is_message_bearing() {
        return None;
    }

    let payload = &segment.payload;
    let peer = payload
        .get("chatId")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let direction = match segment.kind {
        SegmentKind::AiAdvice => Direction::In,
        _ => Direction::Out,
    };

    Some(MessageRecord {
        id: segment.id().to_string(),
        seq: segment.seq,
        ts: segment.ts,
        kind: segment.kind,
        peer,
        direction,
        tag: payload
            .get("tag")
            .and_then(Value::as_str)
            .map(String::from),
        text: payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author: segment.author.hid.as_str().to_string(),
        decision: payload
            .get("decision")
            .and_then(Value::as_str)
            .map(String::from),
        outcome: payload
            .get("outcome")
            .and_then(Value::as_str)
            .map(String::from),
        scores: payload.get("scores").cloned(),
    })
}

/// Replay the projection rules over a full chain.
///
/// Returns the message view and the final score state; used on startup
/// and after a restore.
pub fn replay(segments: &[Segment]) -> (Vec<MessageRecord>, ScoreState) {
    let mut messages = Vec::new();
    let mut scores = ScoreState::default();
    for segment in segments {
        if let Some(message) = message_from_segment(segment) {
            messages.push(message);
        }
        scores.apply(segment);
    }
    (messages, scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancechain_core::{payload, Author, EcdsaKeypair, SegmentBuilder};
    use serde_json::json;

    fn segment_with(kind: SegmentKind, body: Value, seq: u64) -> Segment {
        let kp = EcdsaKeypair::from_seed(&[0x42; 32]).unwrap();
        SegmentBuilder::new(Author::from_keypair(&kp), "head", seq, kind)
            .timestamp(1000 * seq as i64)
            .payload(body)
            .sign(&kp)
    }

    #[test]
    fn test_accept_decision_raises_rich() {
        let mut scores = ScoreState::default();
        scores.apply(&segment_with(
            SegmentKind::BizDecision,
            payload::biz_decision("c", "ACCEPT", None),
            1,
        ));
        assert_eq!(scores.rich, 2);
        assert_eq!(scores.business, 0);
    }

    #[test]
    fn test_reject_decision_no_effect() {
        let mut scores = ScoreState::default();
        scores.apply(&segment_with(
            SegmentKind::BizDecision,
            payload::biz_decision("c", "REJECT", None),
            1,
        ));
        assert_eq!(scores, ScoreState::default());
    }

    #[test]
    fn test_success_outcome_raises_both() {
        let mut scores = ScoreState::default();
        scores.apply(&segment_with(
            SegmentKind::BizOutcome,
            payload::biz_outcome("c", "SUCCESS", 1),
            2,
        ));
        assert_eq!(scores.rich, 5);
        assert_eq!(scores.business, 3);
    }

    #[test]
    fn test_scores_clip_at_100() {
        let mut scores = ScoreState {
            rich: 99,
            business: 99,
        };
        scores.apply(&segment_with(
            SegmentKind::BizOutcome,
            payload::biz_outcome("c", "SUCCESS", 1),
            2,
        ));
        assert_eq!(scores.rich, 100);
        assert_eq!(scores.business, 100);
    }

    #[test]
    fn test_explicit_scores_override() {
        let mut scores = ScoreState::default();
        let mut body = payload::biz_decision("c", "ACCEPT", None);
        body["scores"] = json!({"richScore": 40, "businessScore": 60});
        scores.apply(&segment_with(SegmentKind::BizDecision, body, 1));
        assert_eq!(scores.rich, 40);
        assert_eq!(scores.business, 60);
    }

    #[test]
    fn test_theme_bands() {
        assert_eq!(theme_for(0), "coal");
        assert_eq!(theme_for(24), "coal");
        assert_eq!(theme_for(25), "ember");
        assert_eq!(theme_for(49), "ember");
        assert_eq!(theme_for(50), "bronze");
        assert_eq!(theme_for(79), "bronze");
        assert_eq!(theme_for(80), "gold");
        assert_eq!(theme_for(100), "gold");
    }

    #[test]
    fn test_message_directions() {
        let user = segment_with(SegmentKind::ChatUser, payload::chat_user("hakim", "hi"), 1);
        let advice = segment_with(SegmentKind::AiAdvice, payload::ai_advice("hakim", "yo"), 2);

        assert_eq!(
            message_from_segment(&user).unwrap().direction,
            Direction::Out
        );
        assert_eq!(
            message_from_segment(&advice).unwrap().direction,
            Direction::In
        );
    }

    #[test]
    fn test_non_message_kind_skipped() {
        let mint = segment_with(
            SegmentKind::CapsuleMint,
            payload::capsule_mint("id", "s", 80, 80, "h"),
            3,
        );
        assert!(message_from_segment(&mint).is_none());
    }

    #[test]
    fn test_replay_matches_incremental() {
        let segments = vec![
            segment_with(SegmentKind::ChatUser, payload::chat_user("hakim", "1"), 1),
            segment_with(
                SegmentKind::BizDecision,
                payload::biz_decision("hakim", "ACCEPT", None),
                2,
            ),
            segment_with(
                SegmentKind::BizOutcome,
                payload::biz_outcome("hakim", "SUCCESS", 2),
                3,
            ),
        ];

        let (messages, replayed) = replay(&segments);

        let mut incremental = ScoreState::default();
        for segment in &segments {
            incremental.apply(segment);
        }

        assert_eq!(replayed, incremental);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, segments[0].id().to_string());
    }
}
