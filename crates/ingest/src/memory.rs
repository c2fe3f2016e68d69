//! In-memory store implementations
//!
//! Suitable for tests and single-node development; for production multi-
//! instance deployments use the Postgres backend. Every operation takes the
//! single write lock, so check-and-insert and the default-clearing upsert
//! are atomic by construction, the same guarantees the Postgres backend
//! gets from unique constraints and transactions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::model::{
    BillingHistoryEntry, BillingHistoryInsert, EventStatus, LedgerRecord, PaymentIntent,
    PaymentIntentUpsert, PaymentMethod, PaymentMethodUpsert, Subscription, SubscriptionStatus,
    SubscriptionUpsert,
};
use crate::store::{
    BillingHistoryStore, EventLedger, PaymentIntentStore, PaymentMethodStore, RecordOutcome,
    Stores, SubscriptionStore,
};

#[derive(Default)]
struct State {
    ledger: HashMap<String, LedgerRecord>,
    subscriptions: HashMap<String, Subscription>,
    payment_intents: HashMap<String, PaymentIntent>,
    payment_methods: HashMap<String, PaymentMethod>,
    billing_history: HashMap<String, BillingHistoryEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryStores {
    state: Arc<RwLock<State>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_stores(self) -> Stores {
        let shared = Arc::new(self);
        Stores {
            ledger: shared.clone(),
            subscriptions: shared.clone(),
            payment_intents: shared.clone(),
            payment_methods: shared.clone(),
            billing_history: shared,
        }
    }
}

#[async_trait]
impl EventLedger for MemoryStores {
    async fn record_if_new(
        &self,
        provider_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> IngestResult<RecordOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.ledger.get(provider_event_id) {
            return Ok(RecordOutcome {
                is_new: false,
                record: existing.clone(),
            });
        }

        let record = LedgerRecord {
            id: Uuid::new_v4(),
            provider_event_id: provider_event_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            status: EventStatus::Received,
            error: None,
            retryable: false,
            attempts: 0,
            received_at: OffsetDateTime::now_utc(),
            processing_started_at: None,
            processed_at: None,
        };
        state
            .ledger
            .insert(provider_event_id.to_string(), record.clone());

        Ok(RecordOutcome {
            is_new: true,
            record,
        })
    }

    async fn mark_processing(&self, provider_event_id: &str) -> IngestResult<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state.ledger.get_mut(provider_event_id) else {
            return Ok(false);
        };
        if !matches!(record.status, EventStatus::Received | EventStatus::Failed) {
            return Ok(false);
        }
        record.status = EventStatus::Processing;
        record.processing_started_at = Some(OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn mark_processed(&self, provider_event_id: &str) -> IngestResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .ledger
            .get_mut(provider_event_id)
            .ok_or_else(|| IngestError::EventNotFound(provider_event_id.to_string()))?;
        if record.status != EventStatus::Processing {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "mark_processed outside of processing".to_string(),
            });
        }
        record.status = EventStatus::Processed;
        record.processed_at = Some(OffsetDateTime::now_utc());
        record.error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        provider_event_id: &str,
        error: &str,
        retryable: bool,
    ) -> IngestResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .ledger
            .get_mut(provider_event_id)
            .ok_or_else(|| IngestError::EventNotFound(provider_event_id.to_string()))?;
        if record.status != EventStatus::Processing {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "mark_failed outside of processing".to_string(),
            });
        }
        record.status = EventStatus::Failed;
        record.error = Some(error.to_string());
        record.retryable = retryable;
        record.attempts += 1;
        Ok(())
    }

    async fn reclaim_stuck(&self, older_than: Duration) -> IngestResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let mut state = self.state.write().await;
        let mut reclaimed = 0;

        for record in state.ledger.values_mut() {
            if record.status == EventStatus::Processing
                && record.processing_started_at.is_some_and(|t| t < cutoff)
            {
                record.status = EventStatus::Failed;
                record.error = Some("processing timeout exceeded; reclaimed by reaper".to_string());
                record.retryable = true;
                record.attempts += 1;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, provider_event_id: &str) -> IngestResult<Option<LedgerRecord>> {
        Ok(self.state.read().await.ledger.get(provider_event_id).cloned())
    }

    async fn list_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> IngestResult<Vec<LedgerRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<LedgerRecord> = state
            .ledger
            .values()
            .filter(|r| r.status == EventStatus::Failed && r.retryable && r.attempts < max_attempts)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.received_at);
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStores {
    async fn upsert(&self, params: SubscriptionUpsert) -> IngestResult<Subscription> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        let subscription = match state.subscriptions.get(&params.provider_subscription_id) {
            Some(existing) => Subscription {
                id: existing.id,
                canceled_at: existing.canceled_at,
                created_at: existing.created_at,
                user_id: params.user_id,
                provider_subscription_id: params.provider_subscription_id.clone(),
                provider_customer_id: params.provider_customer_id,
                tier: params.tier,
                status: params.status,
                current_period_start: params.current_period_start,
                current_period_end: params.current_period_end,
                cancel_at_period_end: params.cancel_at_period_end,
                trial_end: params.trial_end,
                plan_id: params.plan_id,
                updated_at: now,
            },
            None => Subscription {
                id: Uuid::new_v4(),
                user_id: params.user_id,
                provider_subscription_id: params.provider_subscription_id.clone(),
                provider_customer_id: params.provider_customer_id,
                tier: params.tier,
                status: params.status,
                current_period_start: params.current_period_start,
                current_period_end: params.current_period_end,
                cancel_at_period_end: params.cancel_at_period_end,
                trial_end: params.trial_end,
                plan_id: params.plan_id,
                canceled_at: None,
                created_at: now,
                updated_at: now,
            },
        };

        if subscription.status.is_live() {
            for other in state.subscriptions.values_mut() {
                if other.user_id == subscription.user_id
                    && other.provider_subscription_id != subscription.provider_subscription_id
                    && other.status.is_live()
                {
                    other.status = SubscriptionStatus::Canceled;
                    other.canceled_at.get_or_insert(now);
                    other.updated_at = now;
                }
            }
        }

        state.subscriptions.insert(
            subscription.provider_subscription_id.clone(),
            subscription.clone(),
        );
        Ok(subscription)
    }

    async fn cancel(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> IngestResult<Option<Subscription>> {
        let mut state = self.state.write().await;
        let Some(subscription) = state.subscriptions.get_mut(provider_subscription_id) else {
            return Ok(None);
        };
        subscription.status = SubscriptionStatus::Canceled;
        subscription.canceled_at.get_or_insert(canceled_at);
        subscription.cancel_at_period_end = false;
        subscription.updated_at = OffsetDateTime::now_utc();
        Ok(Some(subscription.clone()))
    }

    async fn mark_past_due(
        &self,
        provider_subscription_id: &str,
    ) -> IngestResult<Option<Subscription>> {
        let mut state = self.state.write().await;
        let Some(subscription) = state.subscriptions.get_mut(provider_subscription_id) else {
            return Ok(None);
        };
        if !subscription.status.is_live() {
            return Ok(None);
        }
        subscription.status = SubscriptionStatus::PastDue;
        subscription.updated_at = OffsetDateTime::now_utc();
        Ok(Some(subscription.clone()))
    }

    async fn get(&self, provider_subscription_id: &str) -> IngestResult<Option<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .get(provider_subscription_id)
            .cloned())
    }

    async fn find_user_by_customer(
        &self,
        provider_customer_id: &str,
    ) -> IngestResult<Option<Uuid>> {
        let state = self.state.read().await;
        let mut candidates: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.provider_customer_id == provider_customer_id)
            .collect();
        candidates.sort_by_key(|s| s.updated_at);
        Ok(candidates.last().map(|s| s.user_id))
    }
}

#[async_trait]
impl PaymentIntentStore for MemoryStores {
    async fn upsert(&self, params: PaymentIntentUpsert) -> IngestResult<PaymentIntent> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        let intent = match state.payment_intents.get(&params.provider_intent_id) {
            Some(existing) => PaymentIntent {
                id: existing.id,
                created_at: existing.created_at,
                provider_intent_id: params.provider_intent_id.clone(),
                user_id: existing.user_id,
                amount: params.amount,
                currency: params.currency,
                status: params.status,
                updated_at: now,
            },
            None => PaymentIntent {
                id: Uuid::new_v4(),
                provider_intent_id: params.provider_intent_id.clone(),
                user_id: params.user_id,
                amount: params.amount,
                currency: params.currency,
                status: params.status,
                created_at: now,
                updated_at: now,
            },
        };

        state
            .payment_intents
            .insert(intent.provider_intent_id.clone(), intent.clone());
        Ok(intent)
    }

    async fn get(&self, provider_intent_id: &str) -> IngestResult<Option<PaymentIntent>> {
        Ok(self
            .state
            .read()
            .await
            .payment_intents
            .get(provider_intent_id)
            .cloned())
    }
}

#[async_trait]
impl PaymentMethodStore for MemoryStores {
    async fn upsert(&self, params: PaymentMethodUpsert) -> IngestResult<PaymentMethod> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        if params.is_default {
            for other in state.payment_methods.values_mut() {
                if other.user_id == params.user_id
                    && other.provider_method_id != params.provider_method_id
                {
                    other.is_default = false;
                }
            }
        }

        let method = match state.payment_methods.get(&params.provider_method_id) {
            Some(existing) => PaymentMethod {
                id: existing.id,
                created_at: existing.created_at,
                user_id: params.user_id,
                provider_method_id: params.provider_method_id.clone(),
                kind: params.kind,
                brand: params.brand,
                last4: params.last4,
                is_default: params.is_default,
            },
            None => PaymentMethod {
                id: Uuid::new_v4(),
                user_id: params.user_id,
                provider_method_id: params.provider_method_id.clone(),
                kind: params.kind,
                brand: params.brand,
                last4: params.last4,
                is_default: params.is_default,
                created_at: now,
            },
        };

        state
            .payment_methods
            .insert(method.provider_method_id.clone(), method.clone());
        Ok(method)
    }

    async fn remove(&self, provider_method_id: &str) -> IngestResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.payment_methods.remove(provider_method_id).is_some())
    }

    async fn list_for_user(&self, user_id: Uuid) -> IngestResult<Vec<PaymentMethod>> {
        let state = self.state.read().await;
        let mut methods: Vec<PaymentMethod> = state
            .payment_methods
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_at);
        Ok(methods)
    }
}

#[async_trait]
impl BillingHistoryStore for MemoryStores {
    async fn insert_if_absent(&self, params: BillingHistoryInsert) -> IngestResult<bool> {
        let mut state = self.state.write().await;
        if state
            .billing_history
            .contains_key(&params.provider_invoice_id)
        {
            return Ok(false);
        }

        let entry = BillingHistoryEntry {
            id: Uuid::new_v4(),
            user_id: params.user_id,
            provider_invoice_id: params.provider_invoice_id.clone(),
            amount: params.amount,
            currency: params.currency,
            status: params.status,
            period_start: params.period_start,
            period_end: params.period_end,
            hosted_invoice_url: params.hosted_invoice_url,
            invoice_pdf_url: params.invoice_pdf_url,
            created_at: OffsetDateTime::now_utc(),
        };
        state
            .billing_history
            .insert(entry.provider_invoice_id.clone(), entry);
        Ok(true)
    }

    async fn get(&self, provider_invoice_id: &str) -> IngestResult<Option<BillingHistoryEntry>> {
        Ok(self
            .state
            .read()
            .await
            .billing_history
            .get(provider_invoice_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_if_new_is_first_writer_wins() {
        let stores = MemoryStores::new();
        let first = stores.record_if_new("evt_1", "t", "{}").await.unwrap();
        let second = stores.record_if_new("evt_1", "t", "{}").await.unwrap();
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.record.id, second.record.id);
    }

    #[tokio::test]
    async fn processed_records_cannot_transition() {
        let stores = MemoryStores::new();
        stores.record_if_new("evt_1", "t", "{}").await.unwrap();
        assert!(stores.mark_processing("evt_1").await.unwrap());
        stores.mark_processed("evt_1").await.unwrap();

        // Terminal: no further claims, no failure transition.
        assert!(!stores.mark_processing("evt_1").await.unwrap());
        assert!(stores.mark_failed("evt_1", "late", true).await.is_err());
    }

    #[tokio::test]
    async fn failed_records_can_be_reclaimed_for_retry() {
        let stores = MemoryStores::new();
        stores.record_if_new("evt_1", "t", "{}").await.unwrap();
        assert!(stores.mark_processing("evt_1").await.unwrap());
        stores.mark_failed("evt_1", "store down", true).await.unwrap();

        let record = EventLedger::get(&stores, "evt_1").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Failed);
        assert_eq!(record.attempts, 1);

        // Failed records are claimable again.
        assert!(stores.mark_processing("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_ignores_fresh_processing() {
        let stores = MemoryStores::new();
        stores.record_if_new("evt_1", "t", "{}").await.unwrap();
        stores.mark_processing("evt_1").await.unwrap();

        let reclaimed = stores.reclaim_stuck(Duration::minutes(30)).await.unwrap();
        assert_eq!(reclaimed, 0);

        let record = EventLedger::get(&stores, "evt_1").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Processing);
    }
}
