//! Chain-wide integrity: full scans, restore gating, clone detection, and
//! the corruption read-only latch.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use balancechain_core::consts::GENESIS;
use balancechain_core::Segment;
use balancechain_store::{meta_keys, Store};

use crate::error::Result;

/// Error codes a full scan can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "MISSING_SEGMENT")]
    MissingSegment,
    #[serde(rename = "SEQ_MISMATCH")]
    SeqMismatch,
    #[serde(rename = "HASH_CHAIN_BROKEN")]
    HashChainBroken,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "SIGNATURE_ERROR")]
    SignatureError,
    #[serde(rename = "HASH_COMPUTE_ERROR")]
    HashComputeError,
    #[serde(rename = "HEAD_MISMATCH")]
    HeadMismatch,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingSegment => "MISSING_SEGMENT",
            Self::SeqMismatch => "SEQ_MISMATCH",
            Self::HashChainBroken => "HASH_CHAIN_BROKEN",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::SignatureError => "SIGNATURE_ERROR",
            Self::HashComputeError => "HASH_COMPUTE_ERROR",
            Self::HeadMismatch => "HEAD_MISMATCH",
        }
    }
}

/// One scan finding, anchored to a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub seq: u64,
    pub code: ErrorCode,
    pub detail: String,
}

/// Scan severity drives the read-only latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Clean,
    Major,
    Critical,
}

/// The output of a full scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub ok: bool,
    /// Segments examined.
    pub verified: u64,
    pub errors: Vec<ScanIssue>,
    pub warnings: Vec<String>,
    pub computed_head: String,
    pub stored_head: String,
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn severity(&self) -> Severity {
        let mut severity = Severity::Clean;
        for issue in &self.errors {
            match issue.code {
                ErrorCode::HashChainBroken
                | ErrorCode::HeadMismatch
                | ErrorCode::MissingSegment
                | ErrorCode::SeqMismatch => return Severity::Critical,
                ErrorCode::InvalidSignature
                | ErrorCode::SignatureError
                | ErrorCode::HashComputeError => severity = Severity::Major,
            }
        }
        severity
    }
}

/// Walk the whole chain from seq 1, checking linkage, ordering, and
/// (optionally) every signature, then compare the recomputed head with the
/// stored one.
pub async fn scan_chain(store: &dyn Store, verify_signatures: bool) -> Result<ScanReport> {
    let started = Instant::now();
    let len = store.chain_len().await?;
    let stored_head = store.chain_head().await?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut expected_prev = GENESIS.to_string();
    let mut prev_ts: Option<i64> = None;
    let mut verified = 0u64;

    for seq in 1..=len {
        let Some(segment) = store.get_segment(seq).await? else {
            errors.push(ScanIssue {
                seq,
                code: ErrorCode::MissingSegment,
                detail: "no segment at this position".into(),
            });
            continue;
        };
        verified += 1;

        if segment.seq != seq {
            errors.push(ScanIssue {
                seq,
                code: ErrorCode::SeqMismatch,
                detail: format!("stored seq is {}", segment.seq),
            });
        }

        if segment.prev_hash != expected_prev {
            errors.push(ScanIssue {
                seq,
                code: ErrorCode::HashChainBroken,
                detail: format!(
                    "prev_hash {} but expected {}",
                    segment.prev_hash, expected_prev
                ),
            });
        }

        if let Some(prev_ts) = prev_ts {
            if segment.ts < prev_ts {
                warnings.push(format!(
                    "timestamp regression at seq {seq}: {} < {prev_ts}",
                    segment.ts
                ));
            }
        }
        prev_ts = Some(segment.ts);

        if verify_signatures {
            match segment.author.public_key() {
                Ok(_) => {
                    if segment.verify_signature().is_err() {
                        errors.push(ScanIssue {
                            seq,
                            code: ErrorCode::InvalidSignature,
                            detail: "signature does not verify".into(),
                        });
                    }
                }
                Err(e) => {
                    errors.push(ScanIssue {
                        seq,
                        code: ErrorCode::SignatureError,
                        detail: format!("author key unusable: {e}"),
                    });
                }
            }
        }

        expected_prev = segment.block_hash();
    }

    let computed_head = expected_prev;
    if computed_head != stored_head {
        errors.push(ScanIssue {
            seq: len,
            code: ErrorCode::HeadMismatch,
            detail: format!("computed {computed_head} but stored {stored_head}"),
        });
    }

    let report = ScanReport {
        ok: errors.is_empty(),
        verified,
        errors,
        warnings,
        computed_head,
        stored_head,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    if !report.ok {
        warn!(
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "integrity scan found problems"
        );
    }
    Ok(report)
}

/// Run a full scan and latch read-only mode on major or critical findings.
pub async fn scan_and_latch(
    store: &dyn Store,
    verify_signatures: bool,
    now_ms: i64,
) -> Result<ScanReport> {
    let report = scan_chain(store, verify_signatures).await?;
    match report.severity() {
        Severity::Clean => {}
        severity => {
            let reason = report
                .errors
                .first()
                .map(|issue| format!("{} at seq {}", issue.code.as_str(), issue.seq))
                .unwrap_or_else(|| "corruption detected".into());
            info!(?severity, %reason, "latching read-only mode");
            set_read_only(store, &reason, now_ms).await?;
        }
    }
    Ok(report)
}

// ─────────────────────────────────────────────────────────────────────────
// Read-only latch
// ─────────────────────────────────────────────────────────────────────────

/// The persistent read-only latch stored under `meta.read_only`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOnlyState {
    pub enabled: bool,
    pub reason: String,
    pub timestamp: i64,
}

/// Read the latch, if present.
pub async fn read_only_state(store: &dyn Store) -> Result<Option<ReadOnlyState>> {
    match store.get_meta(meta_keys::READ_ONLY).await? {
        Some(value) => Ok(serde_json::from_value(value).ok()),
        None => Ok(None),
    }
}

/// Set the latch. Commits are refused until an operator clears it.
pub async fn set_read_only(store: &dyn Store, reason: &str, now_ms: i64) -> Result<()> {
    let state = ReadOnlyState {
        enabled: true,
        reason: reason.to_string(),
        timestamp: now_ms,
    };
    store
        .set_meta(
            meta_keys::READ_ONLY,
            &serde_json::to_value(&state).unwrap_or(Value::Null),
        )
        .await?;
    Ok(())
}

/// Clear the latch (operator action).
pub async fn clear_read_only(store: &dyn Store) -> Result<()> {
    store.delete_meta(meta_keys::READ_ONLY).await?;
    info!("read-only latch cleared");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────
// Restore gating
// ─────────────────────────────────────────────────────────────────────────

/// Verdict on whether a backup may be restored over the current chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCheck {
    pub can_restore: bool,
    pub requires_sync: bool,
    pub reason: &'static str,
}

/// The "no restore without sync" gate.
///
/// A backup may only replace local state when it cannot lose local
/// segments: a fresh install accepts anything, and otherwise the heads
/// must match exactly.
pub fn check_restore(
    current_len: u64,
    current_head: &str,
    backup_len: u64,
    backup_head: &str,
) -> RestoreCheck {
    if current_len == 0 {
        return RestoreCheck {
            can_restore: true,
            requires_sync: false,
            reason: "fresh install",
        };
    }
    if backup_len < current_len {
        return RestoreCheck {
            can_restore: false,
            requires_sync: true,
            reason: "backup older",
        };
    }
    if backup_head != current_head {
        if backup_len > current_len {
            return RestoreCheck {
                can_restore: false,
                requires_sync: true,
                reason: "diverged, fork",
            };
        }
        return RestoreCheck {
            can_restore: false,
            requires_sync: true,
            reason: "heads mismatch",
        };
    }
    RestoreCheck {
        can_restore: true,
        requires_sync: false,
        reason: "match",
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Clone detection
// ─────────────────────────────────────────────────────────────────────────

/// Evidence that another device holds a diverged copy of this chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    pub is_clone: bool,
    pub seq: u64,
    pub local_nonce: Option<String>,
    pub incoming_nonce: String,
    pub detail: String,
}

/// Compare an incoming segment from another device against local state.
///
/// A same-position segment with a different nonce or signature means the
/// identity was cloned; the caller must flag it, never overwrite.
pub async fn detect_clone(store: &dyn Store, incoming: &Segment) -> Result<CloneReport> {
    let Some(local) = store.get_segment(incoming.seq).await? else {
        return Ok(CloneReport {
            is_clone: false,
            seq: incoming.seq,
            local_nonce: None,
            incoming_nonce: incoming.nonce.clone(),
            detail: "no local segment at this position".into(),
        });
    };

    if local.nonce != incoming.nonce {
        warn!(seq = incoming.seq, "clone detected: nonce divergence");
        return Ok(CloneReport {
            is_clone: true,
            seq: incoming.seq,
            local_nonce: Some(local.nonce),
            incoming_nonce: incoming.nonce.clone(),
            detail: "different nonce at same position".into(),
        });
    }

    if local.signature != incoming.signature {
        warn!(seq = incoming.seq, "clone detected: signature divergence");
        return Ok(CloneReport {
            is_clone: true,
            seq: incoming.seq,
            local_nonce: Some(local.nonce),
            incoming_nonce: incoming.nonce.clone(),
            detail: "different signature at same position".into(),
        });
    }

    Ok(CloneReport {
        is_clone: false,
        seq: incoming.seq,
        local_nonce: Some(local.nonce),
        incoming_nonce: incoming.nonce.clone(),
        detail: "segments identical".into(),
    })
}
