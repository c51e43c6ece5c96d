//! Persisted record types for each collection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use balancechain_core::{Hid, Segment, SegmentKind};

/// Direction of a projected message relative to the chain owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "out")]
    Out,
    #[serde(rename = "in")]
    In,
}

/// A row in the `messages` collection: the per-chat projection of a
/// message-bearing segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// `"{seq}:{nonce}"` of the source segment.
    pub id: String,
    pub seq: u64,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    /// The chat this message belongs to.
    pub peer: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub text: String,
    /// Author HID.
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Value>,
}

/// Quota period for the caps collection. Rows are keyed `"{period}:{hid}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapsPeriod {
    Daily,
    Monthly,
    Yearly,
    Total,
}

impl CapsPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
            Self::Total => "total",
        }
    }

    /// Storage key for a given identity.
    pub fn key(self, hid: &Hid) -> String {
        format!("{}:{}", self.as_str(), hid)
    }

    pub fn all() -> [CapsPeriod; 4] {
        [Self::Daily, Self::Monthly, Self::Yearly, Self::Total]
    }
}

/// A single caps counter with its next reset boundary.
///
/// `resets_at` is `None` for the lifetime total, which never resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsRow {
    pub count: u64,
    pub resets_at: Option<i64>,
}

/// Capsule lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsuleStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "minted")]
    Minted,
    #[serde(rename = "rejected")]
    Rejected,
}

impl CapsuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Minted => "minted",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "minted" => Some(Self::Minted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A row in the `capsules` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleRecord {
    pub id: String,
    pub owner_hid: Hid,
    pub session_id: String,
    pub rich_score: u32,
    pub business_score: u32,
    pub ecf_score: f64,
    pub motivator: String,
    /// Detected business category (wheat/tomato).
    pub category: String,
    pub content_hash: String,
    pub message_count: usize,
    pub status: CapsuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub created_at: i64,
    /// Chain position of the mint segment, once minted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint_seq: Option<u64>,
}

/// The persisted identity record, keyed `"primary"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub version: u32,
    pub hid: Hid,
    pub pubkey: String,
    pub alg: String,
    /// Base64 of the private scalar.
    pub private_key: String,
    /// Platform-authenticator credential handle, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub created_at: i64,
}

/// Everything one commit writes, applied in a single transaction.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub segment: Segment,
    /// The new chain head: the segment's block hash.
    pub new_head: String,
    /// Message projection row, when the kind is message-bearing.
    pub message: Option<MessageRecord>,
    /// Post-increment caps rows for the committing identity.
    pub caps: Vec<(CapsPeriod, Hid, CapsRow)>,
}
