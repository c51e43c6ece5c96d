//! Collaborator boundaries: the AI advisor worker and the payment
//! provider.
//!
//! The chain core does not implement either collaborator. It fixes their
//! wire shapes, the advisor's timeout/retry/fallback discipline, and the
//! meta keys subscription state persists under.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tracing::warn;

use balancechain_store::{meta_keys, Store};

use crate::error::{ChainError, Result};

/// Advisor request timeout.
pub const ADVISOR_TIMEOUT_MS: u64 = 30_000;

/// Advisor retry budget.
pub const ADVISOR_RETRIES: u32 = 3;

/// A request to the AI worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorRequest {
    pub text: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    pub history: Vec<Value>,
    pub turn_index: u32,
}

/// One response bubble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorBubble {
    pub text: String,
}

/// The worker's final verdict, when the conversation concludes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorVerdict {
    pub decision: String,
    pub next_action: String,
}

/// A response from the AI worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorResponse {
    pub bubbles: Vec<AdvisorBubble>,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<AdvisorVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// The transport the host wires in (HTTP worker, local model, ...).
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn advise(&self, request: &AdvisorRequest) -> std::result::Result<AdvisorResponse, String>;
}

/// The local response substituted when the worker is unreachable. Chain
/// side effects are never blocked on the worker.
pub fn fallback_response() -> AdvisorResponse {
    AdvisorResponse {
        bubbles: vec![AdvisorBubble {
            text: "I could not reach the advisor right now. Your message is recorded; \
                   let's continue when the connection returns."
                .into(),
        }],
        verdict: None,
        state: None,
    }
}

/// Call the advisor with the standard timeout and retry budget, falling
/// back to the local response on exhaustion.
pub async fn advise_with_fallback(
    advisor: &dyn Advisor,
    request: &AdvisorRequest,
) -> AdvisorResponse {
    for attempt in 1..=ADVISOR_RETRIES {
        match timeout(
            Duration::from_millis(ADVISOR_TIMEOUT_MS),
            advisor.advise(request),
        )
        .await
        {
            Ok(Ok(response)) => return response,
            Ok(Err(e)) => warn!(attempt, error = %e, "advisor call failed"),
            Err(_) => warn!(attempt, "advisor call timed out"),
        }
    }
    warn!(chat = %request.chat_id, "advisor unavailable, using local fallback");
    fallback_response()
}

// ─────────────────────────────────────────────────────────────────────────
// Subscription state
// ─────────────────────────────────────────────────────────────────────────

/// Subscription state persisted under `meta."subscription:{hid}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub hid: String,
    #[serde(rename = "planId")]
    pub plan_id: String,
    pub provider: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "activatedAt")]
    pub activated_at: i64,
    #[serde(rename = "autoRenew")]
    pub auto_renew: bool,
}

/// Persist subscription state for an identity.
pub async fn save_subscription(store: &dyn Store, record: &SubscriptionRecord) -> Result<()> {
    if record.plan_id.is_empty() {
        return Err(ChainError::Config("empty plan id".into()));
    }
    if record.provider.is_empty() {
        return Err(ChainError::Config("empty payment provider".into()));
    }
    let value = serde_json::to_value(record)
        .map_err(|e| ChainError::Config(e.to_string()))?;
    store
        .set_meta(&meta_keys::subscription(&record.hid), &value)
        .await?;
    Ok(())
}

/// Load subscription state for an identity.
pub async fn load_subscription(
    store: &dyn Store,
    hid: &str,
) -> Result<Option<SubscriptionRecord>> {
    match store.get_meta(&meta_keys::subscription(hid)).await? {
        Some(value) => Ok(serde_json::from_value(value).ok()),
        None => Ok(None),
    }
}

/// Record a payment under `payment:{id}` and index it in `payments:{hid}`.
pub async fn record_payment(
    store: &dyn Store,
    hid: &str,
    payment_id: &str,
    payment: &Value,
) -> Result<()> {
    store
        .set_meta(&meta_keys::payment(payment_id), payment)
        .await?;

    let key = meta_keys::payments(hid);
    let mut ids = match store.get_meta(&key).await? {
        Some(Value::Array(ids)) => ids,
        _ => Vec::new(),
    };
    ids.push(Value::String(payment_id.to_string()));
    store.set_meta(&key, &Value::Array(ids)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancechain_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingAdvisor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Advisor for FailingAdvisor {
        async fn advise(
            &self,
            _request: &AdvisorRequest,
        ) -> std::result::Result<AdvisorResponse, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("connection refused".into())
        }
    }

    fn request() -> AdvisorRequest {
        AdvisorRequest {
            text: "hello".into(),
            chat_id: "hakim".into(),
            history: vec![],
            turn_index: 0,
        }
    }

    #[tokio::test]
    async fn test_fallback_after_retries() {
        let advisor = FailingAdvisor {
            calls: AtomicU32::new(0),
        };
        let response = advise_with_fallback(&advisor, &request()).await;

        assert_eq!(advisor.calls.load(Ordering::SeqCst), ADVISOR_RETRIES);
        assert!(!response.bubbles.is_empty());
        assert!(response.verdict.is_none());
    }

    #[tokio::test]
    async fn test_subscription_roundtrip() {
        let store = MemoryStore::new();
        let record = SubscriptionRecord {
            hid: "HID-1A2B3C4D".into(),
            plan_id: "pro".into(),
            provider: "stripe".into(),
            transaction_id: "txn-1".into(),
            expires_at: 2_000_000_000_000,
            activated_at: 1_700_000_000_000,
            auto_renew: true,
        };

        save_subscription(&store, &record).await.unwrap();
        let loaded = load_subscription(&store, "HID-1A2B3C4D").await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn test_subscription_rejects_empty_plan() {
        let store = MemoryStore::new();
        let record = SubscriptionRecord {
            hid: "HID-1A2B3C4D".into(),
            plan_id: String::new(),
            provider: "stripe".into(),
            transaction_id: "txn-1".into(),
            expires_at: 0,
            activated_at: 0,
            auto_renew: false,
        };
        assert!(matches!(
            save_subscription(&store, &record).await,
            Err(ChainError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_indexing() {
        let store = MemoryStore::new();
        record_payment(&store, "HID-1", "pay-1", &json!({"amount": 5}))
            .await
            .unwrap();
        record_payment(&store, "HID-1", "pay-2", &json!({"amount": 7}))
            .await
            .unwrap();

        let ids = store
            .get_meta(&meta_keys::payments("HID-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ids, json!(["pay-1", "pay-2"]));

        let payment = store
            .get_meta(&meta_keys::payment("pay-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment["amount"], 7);
    }
}
