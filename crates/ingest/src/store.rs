//! Store traits
//!
//! Repository-style seams exposing only the atomic operations the pipeline
//! needs: check-and-insert on the ledger and upsert-by-natural-key on the
//! entities. The pipeline never sees a query language.
//!
//! Backends:
//! - `postgres::PgStores` for production (the relational store is the single
//!   source of truth and the locus of all durability)
//! - `memory::MemoryStores` for tests and single-node development

use std::sync::Arc;

use async_trait::async_trait;
use time::Duration;
use uuid::Uuid;

use crate::error::IngestResult;
use crate::model::{
    BillingHistoryEntry, BillingHistoryInsert, LedgerRecord, PaymentIntent, PaymentIntentUpsert,
    PaymentMethod, PaymentMethodUpsert, Subscription, SubscriptionUpsert,
};

/// Outcome of the ledger's atomic check-and-insert.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    /// True when this call created the record; false when a record for the
    /// provider event id already existed.
    pub is_new: bool,
    pub record: LedgerRecord,
}

/// The deduplication/audit ledger. The unique insert on
/// `provider_event_id` is the single synchronization point that prevents two
/// concurrent deliveries of the same event from both reconciling.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Atomic check-and-insert keyed by `provider_event_id`.
    async fn record_if_new(
        &self,
        provider_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> IngestResult<RecordOutcome>;

    /// Claim the record for processing. Only transitions from `received` or
    /// `failed`; returns false when another worker holds the claim or the
    /// record is already terminal. The loser must not run the handler.
    async fn mark_processing(&self, provider_event_id: &str) -> IngestResult<bool>;

    /// Terminal success. Only valid from `processing`.
    async fn mark_processed(&self, provider_event_id: &str) -> IngestResult<()>;

    /// Terminal failure; increments `attempts`. Only valid from `processing`.
    async fn mark_failed(
        &self,
        provider_event_id: &str,
        error: &str,
        retryable: bool,
    ) -> IngestResult<()>;

    /// Move records stuck in `processing` longer than `older_than` to
    /// `failed` (retryable), making them eligible for resubmission. Used by
    /// the reaper only; stuck records are never re-run inline.
    async fn reclaim_stuck(&self, older_than: Duration) -> IngestResult<u64>;

    async fn get(&self, provider_event_id: &str) -> IngestResult<Option<LedgerRecord>>;

    /// Failed-and-retryable records below the attempt ceiling, oldest first.
    async fn list_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> IngestResult<Vec<LedgerRecord>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Create-or-update by `provider_subscription_id`. When the incoming
    /// status is live, any other live subscription for the same user is
    /// demoted to canceled in the same transaction (one live subscription
    /// per user).
    async fn upsert(&self, params: SubscriptionUpsert) -> IngestResult<Subscription>;

    /// Set status to canceled and stamp the cancellation time. Returns the
    /// updated row, or None when no such subscription exists.
    async fn cancel(
        &self,
        provider_subscription_id: &str,
        canceled_at: time::OffsetDateTime,
    ) -> IngestResult<Option<Subscription>>;

    /// Move a live subscription to past_due after a failed invoice.
    async fn mark_past_due(
        &self,
        provider_subscription_id: &str,
    ) -> IngestResult<Option<Subscription>>;

    async fn get(&self, provider_subscription_id: &str) -> IngestResult<Option<Subscription>>;

    /// Resolve the internal user behind a provider customer id, from any
    /// subscription recorded for that customer.
    async fn find_user_by_customer(
        &self,
        provider_customer_id: &str,
    ) -> IngestResult<Option<Uuid>>;
}

#[async_trait]
pub trait PaymentIntentStore: Send + Sync {
    async fn upsert(&self, params: PaymentIntentUpsert) -> IngestResult<PaymentIntent>;

    async fn get(&self, provider_intent_id: &str) -> IngestResult<Option<PaymentIntent>>;
}

#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    /// Create-or-update by `provider_method_id`. When `is_default` is set,
    /// the user's previous default is cleared in the same transaction; at
    /// most one default per user.
    async fn upsert(&self, params: PaymentMethodUpsert) -> IngestResult<PaymentMethod>;

    /// Remove by `provider_method_id`; returns false (no-op) when already
    /// absent.
    async fn remove(&self, provider_method_id: &str) -> IngestResult<bool>;

    async fn list_for_user(&self, user_id: Uuid) -> IngestResult<Vec<PaymentMethod>>;
}

#[async_trait]
pub trait BillingHistoryStore: Send + Sync {
    /// Create-once by `provider_invoice_id`. Returns false when an entry
    /// already existed; existing entries are never mutated.
    async fn insert_if_absent(&self, params: BillingHistoryInsert) -> IngestResult<bool>;

    async fn get(&self, provider_invoice_id: &str) -> IngestResult<Option<BillingHistoryEntry>>;
}

/// Bundle of store handles threaded through the pipeline. Explicit
/// dependency passing instead of process-wide singletons.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn EventLedger>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub payment_intents: Arc<dyn PaymentIntentStore>,
    pub payment_methods: Arc<dyn PaymentMethodStore>,
    pub billing_history: Arc<dyn BillingHistoryStore>,
}
