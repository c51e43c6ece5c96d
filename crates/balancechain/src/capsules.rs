//! Capsules: summary records minted from qualifying sessions, and the TVM
//! accounting they drive.
//!
//! A capsule is created when a session ends. Ineligible sessions are
//! rejected immediately; eligible ones stay pending until a
//! `capsule.mint` segment lands on the chain, at which point the capsule
//! is marked minted and the owner's TVM balance grows by exactly 1.0.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use balancechain_core::consts::{
    MIN_BUSINESS_SCORE, MIN_ECF_SCORE, MIN_RICH_SCORE, SESSION_MESSAGE_LIMIT,
    SIMILARITY_THRESHOLD, TVM_PER_CAPSULE,
};
use balancechain_core::{canonical_bytes, generate_nonce, payload, sha256_hex, Hid, SegmentKind};
use balancechain_store::{CapsuleRecord, CapsuleStatus, Store};

use crate::chain::ChainHandle;
use crate::clock::Clock;
use crate::error::{ChainError, Result};

/// Analysis output for a finished session.
#[derive(Debug, Clone)]
pub struct SessionAnalysis {
    pub rich_score: u32,
    pub business_score: u32,
    pub ecf_score: f64,
    pub motivator: String,
    /// Detected business category (wheat/tomato).
    pub category: String,
}

/// Handle over the capsule collection.
pub struct CapsuleVault {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl CapsuleVault {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a capsule from a finished session.
    ///
    /// Eligibility is decided immediately: a failing session persists as
    /// `rejected` with a reason, a passing one as `pending`.
    pub async fn create(
        &self,
        session_id: &str,
        owner: &Hid,
        message_texts: &[String],
        analysis: &SessionAnalysis,
    ) -> Result<CapsuleRecord> {
        let content_hash = content_hash(message_texts, analysis);

        let mut record = CapsuleRecord {
            id: format!("cap-{}", &generate_nonce()[..16]),
            owner_hid: owner.clone(),
            session_id: session_id.to_string(),
            rich_score: analysis.rich_score,
            business_score: analysis.business_score,
            ecf_score: analysis.ecf_score,
            motivator: analysis.motivator.clone(),
            category: analysis.category.clone(),
            content_hash,
            message_count: message_texts.len(),
            status: CapsuleStatus::Pending,
            reject_reason: None,
            created_at: self.clock.now_ms(),
            mint_seq: None,
        };

        if let Err(reason) = check_eligibility(&record) {
            record.status = CapsuleStatus::Rejected;
            record.reject_reason = Some(reason);
        }

        self.store.put_capsule(&record).await?;
        Ok(record)
    }

    /// Mint a pending capsule: append the `capsule.mint` segment, mark the
    /// capsule minted, and credit 1.0 TVM to the owner.
    ///
    /// Refused unless the capsule is pending and still eligible. A retry
    /// with an already-minted capsule surfaces the current status rather
    /// than minting twice.
    pub async fn mint(&self, chain: &ChainHandle, capsule_id: &str) -> Result<CapsuleRecord> {
        let mut record = self
            .store
            .get_capsule(capsule_id)
            .await?
            .ok_or_else(|| ChainError::NotMintable(format!("unknown capsule {capsule_id}")))?;

        if record.status != CapsuleStatus::Pending {
            return Err(ChainError::NotMintable(format!(
                "capsule status is {}",
                record.status.as_str()
            )));
        }
        if let Err(reason) = check_eligibility(&record) {
            return Err(ChainError::NotMintable(reason));
        }

        let receipt = chain
            .commit(
                SegmentKind::CapsuleMint,
                payload::capsule_mint(
                    &record.id,
                    &record.session_id,
                    record.rich_score,
                    record.business_score,
                    &record.content_hash,
                ),
            )
            .await?;

        record.status = CapsuleStatus::Minted;
        record.mint_seq = Some(receipt.seq);
        self.store.put_capsule(&record).await?;

        let balance = self
            .store
            .credit_balance(&record.owner_hid, TVM_PER_CAPSULE)
            .await?;
        info!(
            capsule = %record.id,
            seq = receipt.seq,
            balance,
            "capsule minted"
        );

        Ok(record)
    }

    /// Find a minted capsule similar enough to make the candidate
    /// recyclable, if any.
    pub async fn find_recyclable(&self, candidate: &CapsuleRecord) -> Result<Option<CapsuleRecord>> {
        let minted = self.store.capsules_by_status(CapsuleStatus::Minted).await?;
        Ok(minted
            .into_iter()
            .find(|m| similarity(m, candidate) >= SIMILARITY_THRESHOLD))
    }

    pub async fn get(&self, capsule_id: &str) -> Result<Option<CapsuleRecord>> {
        Ok(self.store.get_capsule(capsule_id).await?)
    }

    pub async fn for_session(&self, session_id: &str) -> Result<Vec<CapsuleRecord>> {
        Ok(self.store.capsules_by_session(session_id).await?)
    }
}

/// The content hash binding a capsule to its source conversation.
pub fn content_hash(message_texts: &[String], analysis: &SessionAnalysis) -> String {
    let value = json!({
        "messageTexts": message_texts.join("|"),
        "motivator": analysis.motivator,
        "category": analysis.category,
        "richScore": analysis.rich_score,
    });
    sha256_hex(&canonical_bytes(&value))
}

/// Eligibility gate: both scores, the efficiency factor, and the session
/// length must all clear their thresholds.
pub fn check_eligibility(record: &CapsuleRecord) -> std::result::Result<(), String> {
    if record.rich_score < MIN_RICH_SCORE {
        return Err(format!(
            "rich score {} below minimum {MIN_RICH_SCORE}",
            record.rich_score
        ));
    }
    if record.business_score < MIN_BUSINESS_SCORE {
        return Err(format!(
            "business score {} below minimum {MIN_BUSINESS_SCORE}",
            record.business_score
        ));
    }
    if record.ecf_score < MIN_ECF_SCORE {
        return Err(format!(
            "ECF {} below minimum {MIN_ECF_SCORE}",
            record.ecf_score
        ));
    }
    if record.message_count < SESSION_MESSAGE_LIMIT {
        return Err(format!(
            "{} messages, need {SESSION_MESSAGE_LIMIT}",
            record.message_count
        ));
    }
    Ok(())
}

/// Weighted similarity between two capsules, in [0, 1].
///
/// Weights: motivator 3, category 2, rich proximity 2, business proximity
/// 2, ECF proximity 1; normalized by the total weight of 10.
pub fn similarity(a: &CapsuleRecord, b: &CapsuleRecord) -> f64 {
    let mut score = 0.0;
    if a.motivator == b.motivator {
        score += 3.0;
    }
    if a.category == b.category {
        score += 2.0;
    }
    let rich_delta = (a.rich_score as f64 - b.rich_score as f64).abs();
    score += (1.0 - rich_delta / 100.0) * 2.0;
    let business_delta = (a.business_score as f64 - b.business_score as f64).abs();
    score += (1.0 - business_delta / 100.0) * 2.0;
    let ecf_delta = (a.ecf_score - b.ecf_score).abs();
    score += (1.0 - ecf_delta).max(0.0);
    score / 10.0
}
