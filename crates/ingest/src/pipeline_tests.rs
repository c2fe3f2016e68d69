//! End-to-end pipeline scenarios over the in-memory backends.
//!
//! These exercise the properties the service exists to provide: exactly-once
//! reconciliation under redelivery and races, state invariants across
//! handlers, and the failure/retry path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::cache::InMemoryProjectionCache;
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::memory::MemoryStores;
use crate::model::{
    EventStatus, PaymentIntentStatus, Subscription, SubscriptionStatus, SubscriptionUpsert,
};
use crate::pipeline::{AckOutcome, Pipeline};
use crate::publish::InMemoryBus;
use crate::replay::ReplayService;
use crate::store::{Stores, SubscriptionStore};

const SECRET: &str = "whsec_test_secret";

fn sign(payload: &[u8]) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"test_secret").unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={digest}")
}

struct Harness {
    pipeline: Arc<Pipeline>,
    replay: ReplayService,
    stores: Stores,
    cache: InMemoryProjectionCache,
    bus: InMemoryBus,
}

impl Harness {
    fn new() -> Self {
        Self::with_stores(MemoryStores::new().into_stores())
    }

    fn with_stores(stores: Stores) -> Self {
        let mut config = Config::with_secret(SECRET);
        // Zero timeout lets the reaper tests reclaim immediately.
        config.processing_timeout_secs = 0;
        let cache = InMemoryProjectionCache::new();
        let bus = InMemoryBus::new();
        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            stores.clone(),
            Arc::new(cache.clone()),
            Arc::new(bus.clone()),
        ));
        let replay = ReplayService::new(pipeline.clone(), stores.clone(), config);
        Self {
            pipeline,
            replay,
            stores,
            cache,
            bus,
        }
    }

    async fn deliver(&self, raw: &[u8]) -> IngestResult<AckOutcome> {
        self.pipeline.handle(raw, &sign(raw), None).await
    }
}

fn subscription_event(event_id: &str, sub_id: &str, user_id: Uuid, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "customer.subscription.created",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": sub_id,
            "customer": "cus_1",
            "status": status,
            "metadata": {"user_id": user_id.to_string()},
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "cancel_at_period_end": false,
            "trial_end": null,
            "plan": {"id": "price_pro_monthly", "nickname": "Pro"}
        }}
    }))
    .unwrap()
}

fn payment_method_event(event_id: &str, method_id: &str, user_id: Uuid, default: bool) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "payment_method.attached",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": method_id,
            "customer": "cus_1",
            "metadata": {"user_id": user_id.to_string()},
            "type": "card",
            "card": {"brand": "visa", "last4": "4242"},
            "default": default
        }}
    }))
    .unwrap()
}

fn detach_event(event_id: &str, method_id: &str, user_id: Uuid) -> Vec<u8> {
    // The provider clears `customer` on detach.
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "payment_method.detached",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": method_id,
            "customer": null,
            "metadata": {"user_id": user_id.to_string()},
            "type": "card",
            "card": {"brand": "visa", "last4": "4242"}
        }}
    }))
    .unwrap()
}

fn payment_intent_event(event_id: &str, intent_id: &str, user_id: Uuid, kind: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": kind,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": intent_id,
            "customer": "cus_1",
            "metadata": {"user_id": user_id.to_string()},
            "amount": 2500,
            "currency": "usd"
        }}
    }))
    .unwrap()
}

fn invoice_event(event_id: &str, invoice_id: &str, user_id: Uuid, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "invoice.payment_succeeded",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": invoice_id,
            "customer": "cus_1",
            "subscription": "sub_1",
            "metadata": {"user_id": user_id.to_string()},
            "amount_paid": amount,
            "amount_due": amount,
            "currency": "usd"
        }}
    }))
    .unwrap()
}

/// Subscription store wrapper whose writes fail while the flag is set.
/// Reads always pass through.
struct FlakySubscriptionStore {
    inner: Arc<dyn SubscriptionStore>,
    failing: Arc<AtomicBool>,
}

impl FlakySubscriptionStore {
    fn check(&self) -> IngestResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngestError::Store("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for FlakySubscriptionStore {
    async fn upsert(&self, params: SubscriptionUpsert) -> IngestResult<Subscription> {
        self.check()?;
        self.inner.upsert(params).await
    }

    async fn cancel(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> IngestResult<Option<Subscription>> {
        self.check()?;
        self.inner.cancel(provider_subscription_id, canceled_at).await
    }

    async fn mark_past_due(
        &self,
        provider_subscription_id: &str,
    ) -> IngestResult<Option<Subscription>> {
        self.check()?;
        self.inner.mark_past_due(provider_subscription_id).await
    }

    async fn get(&self, provider_subscription_id: &str) -> IngestResult<Option<Subscription>> {
        self.inner.get(provider_subscription_id).await
    }

    async fn find_user_by_customer(
        &self,
        provider_customer_id: &str,
    ) -> IngestResult<Option<Uuid>> {
        self.inner.find_user_by_customer(provider_customer_id).await
    }
}

#[tokio::test]
async fn redelivered_event_reconciles_exactly_once() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();
    let raw = subscription_event("evt_1", "sub_1", user_id, "active");

    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Processed);
    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Duplicate);

    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
    assert_eq!(harness.bus.count().await, 1);

    let snapshot = harness.cache.snapshot(user_id).await.unwrap();
    assert_eq!(snapshot.tier, "pro");
    assert_eq!(snapshot.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_race_to_one_reconciliation() {
    let harness = Arc::new(Harness::new());
    let user_id = Uuid::new_v4();
    let raw = Arc::new(subscription_event("evt_race", "sub_1", user_id, "active"));
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let harness = harness.clone();
        let raw = raw.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            harness.deliver(&raw).await.unwrap()
        }));
    }

    let mut processed = 0;
    for handle in handles {
        if handle.await.unwrap() == AckOutcome::Processed {
            processed += 1;
        }
    }

    assert_eq!(processed, 1, "exactly one delivery must win the claim");
    assert_eq!(harness.bus.count().await, 1);
    let record = harness.stores.ledger.get("evt_race").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
}

#[tokio::test]
async fn newest_default_payment_method_displaces_the_previous() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();

    harness
        .deliver(&payment_method_event("evt_1", "pm_1", user_id, true))
        .await
        .unwrap();
    harness
        .deliver(&payment_method_event("evt_2", "pm_2", user_id, true))
        .await
        .unwrap();

    let methods = harness
        .stores
        .payment_methods
        .list_for_user(user_id)
        .await
        .unwrap();
    assert_eq!(methods.len(), 2);
    let defaults: Vec<_> = methods.iter().filter(|m| m.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].provider_method_id, "pm_2");
}

#[tokio::test]
async fn detached_method_is_removed_and_absent_detach_is_a_noop() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();

    harness
        .deliver(&payment_method_event("evt_1", "pm_1", user_id, true))
        .await
        .unwrap();
    assert_eq!(
        harness.deliver(&detach_event("evt_2", "pm_1", user_id)).await.unwrap(),
        AckOutcome::Processed
    );

    let methods = harness
        .stores
        .payment_methods
        .list_for_user(user_id)
        .await
        .unwrap();
    assert!(methods.is_empty());

    let published = harness.bus.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].0, "payment:payment_method.detached");
    assert_eq!(published[1].1.data["removed"], true);

    // Detaching a method never on record acknowledges without error.
    assert_eq!(
        harness
            .deliver(&detach_event("evt_3", "pm_unknown", user_id))
            .await
            .unwrap(),
        AckOutcome::Processed
    );
    let published = harness.bus.published().await;
    assert_eq!(published[2].1.data["removed"], false);
    let record = harness.stores.ledger.get("evt_3").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
}

#[tokio::test]
async fn payment_intent_settlement_is_idempotent_across_event_ids() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();

    assert_eq!(
        harness
            .deliver(&payment_intent_event(
                "evt_1",
                "pi_1",
                user_id,
                "payment_intent.succeeded"
            ))
            .await
            .unwrap(),
        AckOutcome::Processed
    );

    let first = harness
        .stores
        .payment_intents
        .get("pi_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, PaymentIntentStatus::Succeeded);
    assert_eq!(first.amount, 2500);
    assert_eq!(first.user_id, user_id);

    // Same intent under a fresh event id resolves to the same row.
    assert_eq!(
        harness
            .deliver(&payment_intent_event(
                "evt_2",
                "pi_1",
                user_id,
                "payment_intent.succeeded"
            ))
            .await
            .unwrap(),
        AckOutcome::Processed
    );
    let second = harness
        .stores
        .payment_intents
        .get("pi_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, PaymentIntentStatus::Succeeded);

    assert_eq!(
        harness
            .deliver(&payment_intent_event(
                "evt_3",
                "pi_2",
                user_id,
                "payment_intent.payment_failed"
            ))
            .await
            .unwrap(),
        AckOutcome::Processed
    );
    let failed = harness
        .stores
        .payment_intents
        .get("pi_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, PaymentIntentStatus::Failed);
}

#[tokio::test]
async fn redelivery_cannot_rerun_a_permanent_failure() {
    let harness = Harness::new();
    let raw = serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "customer.subscription.created",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": "sub_1",
            "customer": "cus_stranger",
            "status": "active",
            "current_period_start": null,
            "current_period_end": null,
            "trial_end": null
        }}
    }))
    .unwrap();

    assert_eq!(
        harness.deliver(&raw).await.unwrap(),
        AckOutcome::Failed { retryable: false }
    );

    // Upstream redelivery acknowledges without touching the handler.
    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Duplicate);
    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Failed);
    assert_eq!(record.attempts, 1);

    // An operator resubmit still re-runs it, here after the customer has
    // become resolvable.
    let known_user = Uuid::new_v4();
    harness
        .stores
        .subscriptions
        .upsert(SubscriptionUpsert {
            user_id: known_user,
            provider_subscription_id: "sub_existing".to_string(),
            provider_customer_id: "cus_stranger".to_string(),
            tier: "pro".to_string(),
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_end: None,
            plan_id: None,
        })
        .await
        .unwrap();

    assert_eq!(
        harness.pipeline.resubmit("evt_1").await.unwrap(),
        AckOutcome::Processed
    );
    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
}

#[tokio::test]
async fn a_new_live_subscription_demotes_the_previous_one() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();

    harness
        .deliver(&subscription_event("evt_1", "sub_old", user_id, "active"))
        .await
        .unwrap();
    harness
        .deliver(&subscription_event("evt_2", "sub_new", user_id, "active"))
        .await
        .unwrap();

    let old = harness
        .stores
        .subscriptions
        .get("sub_old")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.status, SubscriptionStatus::Canceled);
    assert!(old.canceled_at.is_some());

    let new = harness
        .stores
        .subscriptions
        .get("sub_new")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn billing_history_rows_are_immutable() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();

    harness
        .deliver(&invoice_event("evt_1", "in_1", user_id, 2900))
        .await
        .unwrap();
    // Same invoice under a fresh event id, with a different amount the
    // existing row must not absorb.
    harness
        .deliver(&invoice_event("evt_2", "in_1", user_id, 9999))
        .await
        .unwrap();

    let entry = harness
        .stores
        .billing_history
        .get("in_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.amount, 2900);
}

#[tokio::test]
async fn unhandled_event_type_is_recorded_and_dropped() {
    let harness = Harness::new();
    let raw = serde_json::to_vec(&json!({
        "id": "evt_odd",
        "type": "customer.created",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {"id": "cus_1"}}
    }))
    .unwrap();

    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Ignored);

    let record = harness.stores.ledger.get("evt_odd").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
    assert_eq!(harness.bus.count().await, 0);
}

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let base = MemoryStores::new();
    let failing = Arc::new(AtomicBool::new(true));
    let mut stores = base.into_stores();
    stores.subscriptions = Arc::new(FlakySubscriptionStore {
        inner: stores.subscriptions.clone(),
        failing: failing.clone(),
    });
    let harness = Harness::with_stores(stores);

    let user_id = Uuid::new_v4();
    let raw = subscription_event("evt_1", "sub_1", user_id, "active");

    assert_eq!(
        harness.deliver(&raw).await.unwrap(),
        AckOutcome::Failed { retryable: true }
    );
    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Failed);
    assert!(record.retryable);
    assert_eq!(record.attempts, 1);
    assert_eq!(harness.bus.count().await, 0);

    failing.store(false, Ordering::SeqCst);
    let summary = harness.replay.retry_failed(10).await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.processed, 1);

    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
    assert!(harness
        .stores
        .subscriptions
        .get("sub_1")
        .await
        .unwrap()
        .is_some());
    assert_eq!(harness.bus.count().await, 1);
}

#[tokio::test]
async fn unattributable_payload_fails_permanently() {
    let harness = Harness::new();
    // No user_id metadata and no subscription on record for the customer.
    let raw = serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "customer.subscription.created",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": "sub_1",
            "customer": "cus_stranger",
            "status": "active",
            "current_period_start": null,
            "current_period_end": null,
            "trial_end": null
        }}
    }))
    .unwrap();

    assert_eq!(
        harness.deliver(&raw).await.unwrap(),
        AckOutcome::Failed { retryable: false }
    );

    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Failed);
    assert!(!record.retryable);
    let retryable = harness.stores.ledger.list_retryable(5, 10).await.unwrap();
    assert!(retryable.is_empty());
}

#[tokio::test]
async fn trial_notice_publishes_without_state_writes() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();
    let raw = serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "customer.subscription.trial_will_end",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": "sub_1",
            "customer": "cus_1",
            "status": "trialing",
            "metadata": {"user_id": user_id.to_string()},
            "current_period_start": null,
            "current_period_end": null,
            "trial_end": 1_700_864_000
        }}
    }))
    .unwrap();

    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Processed);
    assert!(harness
        .stores
        .subscriptions
        .get("sub_1")
        .await
        .unwrap()
        .is_none());

    let published = harness.bus.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "payment:trial.will_end");
    assert_eq!(published[0].1.user_id, Some(user_id));
}

#[tokio::test]
async fn bad_signature_leaves_no_trace() {
    let harness = Harness::new();
    let raw = subscription_event("evt_1", "sub_1", Uuid::new_v4(), "active");
    let forged = sign(b"different payload");

    let err = harness.pipeline.handle(&raw, &forged, None).await;
    assert!(matches!(err, Err(IngestError::Verification(_))));
    assert!(harness.stores.ledger.get("evt_1").await.unwrap().is_none());
}

#[tokio::test]
async fn bus_outage_does_not_affect_the_ledger() {
    let harness = Harness::new();
    harness.bus.set_failing(true);
    let user_id = Uuid::new_v4();
    let raw = subscription_event("evt_1", "sub_1", user_id, "active");

    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Processed);
    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Processed);
    assert!(harness
        .stores
        .subscriptions
        .get("sub_1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn reaper_reclaims_abandoned_claims_for_retry() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();
    let raw = subscription_event("evt_1", "sub_1", user_id, "active");

    // Simulate a worker that claimed the event and died.
    let payload = String::from_utf8(raw.clone()).unwrap();
    harness
        .stores
        .ledger
        .record_if_new("evt_1", "customer.subscription.created", &payload)
        .await
        .unwrap();
    assert!(harness.stores.ledger.mark_processing("evt_1").await.unwrap());

    // Harness runs with a zero processing timeout.
    let reclaimed = harness.replay.reclaim_stuck().await.unwrap();
    assert_eq!(reclaimed, 1);
    let record = harness.stores.ledger.get("evt_1").await.unwrap().unwrap();
    assert_eq!(record.status, EventStatus::Failed);
    assert!(record.retryable);

    let summary = harness.replay.retry_failed(10).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert!(harness
        .stores
        .subscriptions
        .get("sub_1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn resubmitting_a_processed_event_is_refused() {
    let harness = Harness::new();
    let raw = subscription_event("evt_1", "sub_1", Uuid::new_v4(), "active");
    harness.deliver(&raw).await.unwrap();

    let err = harness.pipeline.resubmit("evt_1").await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));

    let err = harness.pipeline.resubmit("evt_unknown").await.unwrap_err();
    assert!(matches!(err, IngestError::EventNotFound(_)));
}

#[tokio::test]
async fn canceled_subscription_drops_the_cached_snapshot() {
    let harness = Harness::new();
    let user_id = Uuid::new_v4();
    harness
        .deliver(&subscription_event("evt_1", "sub_1", user_id, "active"))
        .await
        .unwrap();
    assert!(harness.cache.snapshot(user_id).await.is_some());

    let raw = serde_json::to_vec(&json!({
        "id": "evt_2",
        "type": "customer.subscription.deleted",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {"object": {
            "id": "sub_1",
            "customer": "cus_1",
            "status": "canceled",
            "metadata": {"user_id": user_id.to_string()},
            "current_period_start": null,
            "current_period_end": null,
            "trial_end": null
        }}
    }))
    .unwrap();
    assert_eq!(harness.deliver(&raw).await.unwrap(), AckOutcome::Processed);

    assert!(harness.cache.snapshot(user_id).await.is_none());
    let stored = harness
        .stores
        .subscriptions
        .get("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Canceled);
}
