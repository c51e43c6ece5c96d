//! The nine-rule validation gate.
//!
//! Every rule is a standalone function returning either pass or a
//! [`RuleFailure`] carrying its rule number, a stable reason code, and a
//! human message. [`validate`] composes them in order and short-circuits
//! on the first failure.
//!
//! The rules read chain state (head, length, previous segment, caps,
//! nonce log) through a [`ValidationContext`] the committer assembles
//! inside its critical section, so a rule never races a parallel append.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use balancechain_core::consts::{
    DAILY_CAP, MIN_BLOCK_INTERVAL_MS, MONTHLY_CAP, UTC_TOLERANCE_MS, YEARLY_CAP,
};
use balancechain_core::{validate_structure, Segment, SegmentRef};

use crate::identity::{LivenessProof, LivenessVerifier};

/// Stable reason codes for rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    InvalidStructure,
    CounterOrder,
    MissingRefs,
    DailyCapExceeded,
    MonthlyCapExceeded,
    YearlyCapExceeded,
    RateLimit,
    TimestampDrift,
    StaleLiveness,
    InvalidLiveness,
    MissingPreviousOwner,
    SameOwner,
    BadPrevHash,
    BadSeq,
    BadSignature,
    ReplayNonce,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidStructure => "invalid_structure",
            Self::CounterOrder => "counter_order",
            Self::MissingRefs => "missing_refs",
            Self::DailyCapExceeded => "daily_cap_exceeded",
            Self::MonthlyCapExceeded => "monthly_cap_exceeded",
            Self::YearlyCapExceeded => "yearly_cap_exceeded",
            Self::RateLimit => "rate_limit",
            Self::TimestampDrift => "timestamp_drift",
            Self::StaleLiveness => "stale_liveness",
            Self::InvalidLiveness => "invalid_liveness",
            Self::MissingPreviousOwner => "missing_previous_owner",
            Self::SameOwner => "same_owner",
            Self::BadPrevHash => "bad_prev_hash",
            Self::BadSeq => "bad_seq",
            Self::BadSignature => "bad_signature",
            Self::ReplayNonce => "replay_nonce",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured rule rejection. Rule 0 marks the structural pre-filter.
#[derive(Debug, Clone, Error)]
#[error("rule {rule} ({reason}): {message}")]
pub struct RuleFailure {
    pub rule: u8,
    pub reason: Reason,
    pub message: String,
}

impl RuleFailure {
    pub fn new(rule: u8, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            rule,
            reason,
            message: message.into(),
        }
    }
}

type RuleResult = std::result::Result<(), RuleFailure>;

/// Caps counters after any pending reset, as read by rule 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapsCounters {
    pub daily: u64,
    pub monthly: u64,
    pub yearly: u64,
}

/// Chain state gathered by the committer for one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub chain_head: String,
    pub chain_len: u64,
    /// The segment currently at the head, if any.
    pub prev_segment: Option<Segment>,
    /// Whether the candidate's nonce already appears in the nonce log.
    pub nonce_replayed: bool,
    /// Whether the referenced unlocker/unlocked segments exist.
    pub unlocker_exists: bool,
    pub unlocked_exists: bool,
    pub caps: CapsCounters,
    pub now_ms: i64,
}

/// Options for a validation pass.
pub struct ValidatorOptions<'a> {
    /// Skip rule 4 entirely (testing only).
    pub skip_liveness: bool,
    pub verifier: &'a dyn LivenessVerifier,
}

/// Run the structural pre-filter and all nine rules in order.
pub fn validate(
    segment: &Segment,
    ctx: &ValidationContext,
    opts: &ValidatorOptions<'_>,
) -> RuleResult {
    validate_structure(segment)
        .map_err(|e| RuleFailure::new(0, Reason::InvalidStructure, e.to_string()))?;

    rule_counter_relationship(segment, ctx)?;
    rule_caps(ctx)?;
    rule_rate_limit(segment, ctx)?;
    if !opts.skip_liveness {
        rule_liveness(segment, ctx, opts.verifier)?;
    }
    rule_owner_transition(segment)?;
    rule_history_hash(segment, ctx)?;
    rule_sequence(segment, ctx)?;
    rule_signature(segment)?;
    rule_nonce(segment, ctx)?;
    Ok(())
}

/// Rule 1: when both refs are present, the unlocker must come after the
/// unlocked segment, and both must exist.
pub fn rule_counter_relationship(segment: &Segment, ctx: &ValidationContext) -> RuleResult {
    let (Some(unlocker), Some(unlocked)) = (&segment.unlocker_ref, &segment.unlocked_ref) else {
        return Ok(());
    };

    let unlocker = SegmentRef::parse(unlocker)
        .map_err(|e| RuleFailure::new(1, Reason::MissingRefs, e.to_string()))?;
    let unlocked = SegmentRef::parse(unlocked)
        .map_err(|e| RuleFailure::new(1, Reason::MissingRefs, e.to_string()))?;

    if unlocker.seq <= unlocked.seq {
        return Err(RuleFailure::new(
            1,
            Reason::CounterOrder,
            format!(
                "unlocker seq {} must exceed unlocked seq {}",
                unlocker.seq, unlocked.seq
            ),
        ));
    }

    if !ctx.unlocker_exists || !ctx.unlocked_exists {
        return Err(RuleFailure::new(
            1,
            Reason::MissingRefs,
            "referenced segment does not exist",
        ));
    }

    Ok(())
}

/// Rule 2: reject when any periodic counter is already at its cap.
pub fn rule_caps(ctx: &ValidationContext) -> RuleResult {
    let checks = [
        (ctx.caps.daily, DAILY_CAP, Reason::DailyCapExceeded),
        (ctx.caps.monthly, MONTHLY_CAP, Reason::MonthlyCapExceeded),
        (ctx.caps.yearly, YEARLY_CAP, Reason::YearlyCapExceeded),
    ];
    for (count, cap, reason) in checks {
        if count >= cap {
            return Err(RuleFailure::new(
                2,
                reason,
                format!("counter {count} at cap {cap}"),
            ));
        }
    }
    Ok(())
}

/// Rule 3: enforce the minimum interval between same-author segments, and
/// the bounded backwards-drift tolerance.
pub fn rule_rate_limit(segment: &Segment, ctx: &ValidationContext) -> RuleResult {
    let Some(prev) = &ctx.prev_segment else {
        return Ok(());
    };
    if prev.author.hid != segment.author.hid {
        return Ok(());
    }

    let delta = segment.ts - prev.ts;
    if delta < -UTC_TOLERANCE_MS {
        return Err(RuleFailure::new(
            3,
            Reason::TimestampDrift,
            format!("timestamp regressed {}ms beyond tolerance", -delta),
        ));
    }
    if delta < MIN_BLOCK_INTERVAL_MS {
        return Err(RuleFailure::new(
            3,
            Reason::RateLimit,
            format!("{delta}ms since previous segment, minimum is {MIN_BLOCK_INTERVAL_MS}ms"),
        ));
    }
    Ok(())
}

/// Rule 4: when a liveness proof is attached, require shape, freshness
/// within the tolerance window, and verifier approval. Absence is
/// tolerated with a warning.
pub fn rule_liveness(
    segment: &Segment,
    ctx: &ValidationContext,
    verifier: &dyn LivenessVerifier,
) -> RuleResult {
    let Some(raw) = segment.payload.get("liveness") else {
        warn!(seq = segment.seq, "segment carries no liveness proof");
        return Ok(());
    };

    let proof: LivenessProof = serde_json::from_value(raw.clone())
        .map_err(|e| RuleFailure::new(4, Reason::InvalidLiveness, e.to_string()))?;

    if proof.kind != "webauthn" && proof.kind != "timestamp" {
        return Err(RuleFailure::new(
            4,
            Reason::InvalidLiveness,
            format!("unknown liveness type {:?}", proof.kind),
        ));
    }

    let age = (ctx.now_ms - proof.timestamp).abs();
    if age > UTC_TOLERANCE_MS {
        return Err(RuleFailure::new(
            4,
            Reason::StaleLiveness,
            format!("proof is {age}ms old, tolerance is {UTC_TOLERANCE_MS}ms"),
        ));
    }

    if !verifier.verify(&proof) {
        return Err(RuleFailure::new(
            4,
            Reason::InvalidLiveness,
            "liveness verification failed",
        ));
    }

    Ok(())
}

/// Rule 5: transfers must name a previous owner different from the
/// current owner.
pub fn rule_owner_transition(segment: &Segment) -> RuleResult {
    if !segment.kind.is_transfer() {
        return Ok(());
    }
    let Some(previous_owner) = &segment.previous_owner else {
        return Err(RuleFailure::new(
            5,
            Reason::MissingPreviousOwner,
            "transfer segment without previous_owner",
        ));
    };
    if previous_owner == &segment.current_owner {
        return Err(RuleFailure::new(
            5,
            Reason::SameOwner,
            "transfer must change ownership",
        ));
    }
    Ok(())
}

/// Rule 6: the segment must extend the stored head.
pub fn rule_history_hash(segment: &Segment, ctx: &ValidationContext) -> RuleResult {
    if segment.prev_hash != ctx.chain_head {
        return Err(RuleFailure::new(
            6,
            Reason::BadPrevHash,
            format!(
                "prev_hash {} does not match head {}",
                segment.prev_hash, ctx.chain_head
            ),
        ));
    }
    Ok(())
}

/// Rule 7: the sequence number must be exactly the next position.
pub fn rule_sequence(segment: &Segment, ctx: &ValidationContext) -> RuleResult {
    if segment.seq != ctx.chain_len + 1 {
        return Err(RuleFailure::new(
            7,
            Reason::BadSeq,
            format!("seq {} but chain length is {}", segment.seq, ctx.chain_len),
        ));
    }
    Ok(())
}

/// Rule 8: the signature must verify against the declared author key.
pub fn rule_signature(segment: &Segment) -> RuleResult {
    segment
        .verify_signature()
        .map_err(|_| RuleFailure::new(8, Reason::BadSignature, "signature verification failed"))
}

/// Rule 9: the nonce must not appear in the nonce log.
pub fn rule_nonce(segment: &Segment, ctx: &ValidationContext) -> RuleResult {
    if ctx.nonce_replayed {
        return Err(RuleFailure::new(
            9,
            Reason::ReplayNonce,
            format!("nonce {} already logged", segment.nonce),
        ));
    }
    Ok(())
}

/// Extract the liveness proof from a payload, if one is attached.
pub fn liveness_proof(payload: &Value) -> Option<LivenessProof> {
    payload
        .get("liveness")
        .and_then(|raw| serde_json::from_value(raw.clone()).ok())
}
