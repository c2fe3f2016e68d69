//! Billing entities and ledger records
//!
//! Plain data structures; every entity is keyed by the provider's natural
//! identifier so redelivery resolves to the same row. All persistence goes
//! through the store traits in `store.rs`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Processing status of a ledger record. Transitions are monotonic: a
/// `Processed` record never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(EventStatus::Received),
            "processing" => Some(EventStatus::Processing),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the deduplication/audit ledger.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    /// Exact raw body as received; replay re-runs from this.
    pub payload: String,
    pub status: EventStatus,
    pub error: Option<String>,
    /// Whether the recorded failure is worth retrying automatically.
    pub retryable: bool,
    pub attempts: i32,
    pub received_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }

    /// A live subscription counts against the one-per-user invariant.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub tier: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub plan_id: Option<String>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Upsert parameters for a subscription, derived from the provider payload.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub tier: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentIntentStatus {
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentIntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentIntentStatus::RequiresAction => "requires_action",
            PaymentIntentStatus::Processing => "processing",
            PaymentIntentStatus::Succeeded => "succeeded",
            PaymentIntentStatus::Failed => "failed",
            PaymentIntentStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requires_action" => Some(PaymentIntentStatus::RequiresAction),
            "processing" => Some(PaymentIntentStatus::Processing),
            "succeeded" => Some(PaymentIntentStatus::Succeeded),
            "failed" => Some(PaymentIntentStatus::Failed),
            "canceled" => Some(PaymentIntentStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub provider_intent_id: String,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentIntentStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PaymentIntentUpsert {
    pub provider_intent_id: String,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentIntentStatus,
}

#[derive(Debug, Clone)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_method_id: String,
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub is_default: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PaymentMethodUpsert {
    pub user_id: Uuid,
    pub provider_method_id: String,
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub is_default: bool,
}

/// Immutable once created; re-delivered invoice events never touch an
/// existing row.
#[derive(Debug, Clone)]
pub struct BillingHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_invoice_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct BillingHistoryInsert {
    pub user_id: Uuid,
    pub provider_invoice_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

/// Plan tier derived from the provider payload: explicit metadata wins,
/// otherwise the price id is matched by substring (price ids embed the tier
/// name, e.g. `price_pro_monthly`).
pub fn derive_tier(metadata_tier: Option<&str>, plan_id: Option<&str>) -> String {
    if let Some(tier) = metadata_tier {
        if !tier.is_empty() {
            return tier.to_string();
        }
    }
    if let Some(plan) = plan_id {
        let plan = plan.to_ascii_lowercase();
        for tier in ["enterprise", "team", "pro", "starter", "free"] {
            if plan.contains(tier) {
                return tier.to_string();
            }
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            EventStatus::Received,
            EventStatus::Processing,
            EventStatus::Processed,
            EventStatus::Failed,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("bogus"), None);
    }

    #[test]
    fn live_statuses() {
        assert!(SubscriptionStatus::Trialing.is_live());
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::PastDue.is_live());
        assert!(!SubscriptionStatus::Canceled.is_live());
        assert!(!SubscriptionStatus::Incomplete.is_live());
    }

    #[test]
    fn tier_derivation_prefers_metadata() {
        assert_eq!(derive_tier(Some("team"), Some("price_pro_monthly")), "team");
        assert_eq!(derive_tier(None, Some("price_pro_monthly")), "pro");
        assert_eq!(derive_tier(Some(""), Some("PRICE_TEAM_ANNUAL")), "team");
        assert_eq!(derive_tier(None, None), "unknown");
    }
}
