//! Protocol constants.
//!
//! Everything in this module is consensus-significant: changing a value
//! breaks hash or validation compatibility with existing chains.

/// Current segment protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Sentinel previous-hash for the first segment of a chain.
pub const GENESIS: &str = "GENESIS";

/// Unlocked capacity every identity starts with.
pub const INITIAL_UNLOCKED: u64 = 1200;

/// Maximum cap-affecting segments per UTC day.
pub const DAILY_CAP: u64 = 3600;

/// Maximum cap-affecting segments per UTC month.
pub const MONTHLY_CAP: u64 = 36_000;

/// Maximum cap-affecting segments per UTC year.
pub const YEARLY_CAP: u64 = 120_000;

/// Minimum interval between two segments by the same author.
pub const MIN_BLOCK_INTERVAL_MS: i64 = 1000;

/// Tolerated backwards clock drift between adjacent segments, and the
/// freshness window for liveness proofs (12 minutes).
pub const UTC_TOLERANCE_MS: i64 = 720_000;

/// Minimum rich score for capsule eligibility.
pub const MIN_RICH_SCORE: u32 = 70;

/// Minimum business score for capsule eligibility.
pub const MIN_BUSINESS_SCORE: u32 = 70;

/// Minimum efficiency factor for capsule eligibility.
pub const MIN_ECF_SCORE: f64 = 0.1;

/// Similarity at or above this marks a candidate capsule recyclable.
pub const SIMILARITY_THRESHOLD: f64 = 0.9;

/// Minimum messages in a session before a capsule qualifies.
pub const SESSION_MESSAGE_LIMIT: usize = 12;

/// TVM credited per minted capsule.
pub const TVM_PER_CAPSULE: f64 = 1.0;

/// Segment nonce length in bytes (encoded as 32 hex chars).
pub const NONCE_LEN: usize = 16;

/// Nonce-log entries older than this may be purged.
pub const NONCE_PURGE_AGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Encrypted identity backup format version.
pub const BACKUP_VERSION: u8 = 1;

/// PBKDF2-SHA256 iteration count for backup key derivation.
pub const BACKUP_KDF_ITERATIONS: u32 = 100_000;

/// Rich-score theme bands: `[lower, upper)` except gold, which includes 100.
pub const THEME_BANDS: [(&str, u32, u32); 4] = [
    ("coal", 0, 25),
    ("ember", 25, 50),
    ("bronze", 50, 80),
    ("gold", 80, 100),
];
