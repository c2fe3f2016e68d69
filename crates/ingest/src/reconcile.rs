//! State reconciliation handlers
//!
//! One handler per routed event family. Each handler converges local state
//! toward what the payload describes using upsert-by-natural-key writes, so
//! running the same event twice lands in the same state. Handlers return the
//! resolved user, the outbound event payload, and the cache action to take
//! after the write commits; publication itself is the pipeline's job.

use std::collections::HashMap;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::SubscriptionSnapshot;
use crate::error::{IngestError, IngestResult};
use crate::event::{from_unix, metadata_user_id, require_unix, ProviderEvent, SubscriptionObject};
use crate::model::{
    derive_tier, BillingHistoryInsert, PaymentIntentStatus, PaymentIntentUpsert,
    PaymentMethodUpsert, SubscriptionStatus, SubscriptionUpsert,
};
use crate::router::EventKind;
use crate::store::Stores;

/// What the pipeline should do to the read projection after the handler's
/// write has committed.
#[derive(Debug, Clone)]
pub enum CacheAction {
    None,
    /// Drop the cached summary; the next read repopulates it.
    Invalidate(Uuid),
    /// Replace the cached summary with the just-committed snapshot.
    Refresh(Uuid, SubscriptionSnapshot),
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub user_id: Option<Uuid>,
    /// Payload for the outbound domain event.
    pub data: serde_json::Value,
    pub cache: CacheAction,
}

/// Applies routed events to the stores. Stateless apart from the store
/// handles; safe to share across deliveries.
#[derive(Clone)]
pub struct Reconciler {
    stores: Stores,
}

impl Reconciler {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn apply(
        &self,
        kind: EventKind,
        event: &ProviderEvent,
    ) -> IngestResult<ReconcileOutcome> {
        match kind {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.upsert_subscription(event).await
            }
            EventKind::SubscriptionDeleted => self.cancel_subscription(event).await,
            EventKind::TrialWillEnd => self.trial_will_end(event).await,
            EventKind::InvoicePaymentSucceeded => self.invoice_paid(event).await,
            EventKind::InvoicePaymentFailed => self.invoice_failed(event).await,
            EventKind::PaymentIntentSucceeded => {
                self.settle_payment_intent(event, PaymentIntentStatus::Succeeded)
                    .await
            }
            EventKind::PaymentIntentFailed => {
                self.settle_payment_intent(event, PaymentIntentStatus::Failed)
                    .await
            }
            EventKind::PaymentMethodAttached => self.attach_payment_method(event).await,
            EventKind::PaymentMethodDetached => self.detach_payment_method(event).await,
            EventKind::DisputeCreated | EventKind::DisputeClosed => {
                self.record_dispute(event, kind).await
            }
        }
    }

    /// Resolve the internal user for a payload: explicit metadata stamp
    /// first, then lookup by provider customer id. Failure here is permanent;
    /// a payload we cannot attribute will never become attributable.
    async fn resolve_user(
        &self,
        metadata: &HashMap<String, String>,
        customer: Option<&str>,
    ) -> IngestResult<Uuid> {
        if let Some(user_id) = metadata_user_id(metadata) {
            return Ok(user_id);
        }
        let customer = customer.ok_or(IngestError::MissingField("customer"))?;
        match self
            .stores
            .subscriptions
            .find_user_by_customer(customer)
            .await?
        {
            Some(user_id) => Ok(user_id),
            None => Err(IngestError::UnknownUser(customer.to_string())),
        }
    }

    /// Best-effort user resolution for events that may arrive after the
    /// provider has already unlinked the customer.
    async fn try_resolve_user(
        &self,
        metadata: &HashMap<String, String>,
        customer: Option<&str>,
    ) -> IngestResult<Option<Uuid>> {
        if let Some(user_id) = metadata_user_id(metadata) {
            return Ok(Some(user_id));
        }
        match customer {
            Some(customer) => self.stores.subscriptions.find_user_by_customer(customer).await,
            None => Ok(None),
        }
    }

    fn subscription_upsert(
        obj: &SubscriptionObject,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> SubscriptionUpsert {
        SubscriptionUpsert {
            user_id,
            provider_subscription_id: obj.id.clone(),
            provider_customer_id: obj.customer.clone(),
            tier: derive_tier(
                obj.metadata.get("tier").map(String::as_str),
                obj.plan.as_ref().map(|p| p.id.as_str()),
            ),
            status,
            current_period_start: obj.current_period_start.and_then(from_unix),
            current_period_end: obj.current_period_end.and_then(from_unix),
            cancel_at_period_end: obj.cancel_at_period_end,
            trial_end: obj.trial_end.and_then(from_unix),
            plan_id: obj.plan.as_ref().map(|p| p.id.clone()),
        }
    }

    async fn upsert_subscription(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.subscription()?;
        let user_id = self.resolve_user(&obj.metadata, Some(&obj.customer)).await?;
        let status =
            SubscriptionStatus::parse(&obj.status).ok_or_else(|| IngestError::InvalidValue {
                field: "status",
                value: obj.status.clone(),
            })?;

        let subscription = self
            .stores
            .subscriptions
            .upsert(Self::subscription_upsert(&obj, user_id, status))
            .await?;

        tracing::info!(
            user_id = %user_id,
            provider_subscription_id = %subscription.provider_subscription_id,
            status = %subscription.status,
            tier = %subscription.tier,
            "reconciled subscription"
        );

        let snapshot = SubscriptionSnapshot::from_subscription(&subscription);
        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_subscription_id": subscription.provider_subscription_id,
                "tier": subscription.tier,
                "status": subscription.status.as_str(),
                "cancel_at_period_end": subscription.cancel_at_period_end,
                "current_period_end": subscription
                    .current_period_end
                    .map(OffsetDateTime::unix_timestamp),
            }),
            cache: CacheAction::Refresh(user_id, snapshot),
        })
    }

    async fn cancel_subscription(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.subscription()?;
        let canceled_at = require_unix(event.created, "created")?;

        let subscription = match self.stores.subscriptions.cancel(&obj.id, canceled_at).await? {
            Some(subscription) => subscription,
            None => {
                // Deletion can outrun creation when the provider delivers out
                // of order. Materialize the row, then cancel it.
                let user_id = self.resolve_user(&obj.metadata, Some(&obj.customer)).await?;
                self.stores
                    .subscriptions
                    .upsert(Self::subscription_upsert(
                        &obj,
                        user_id,
                        SubscriptionStatus::Canceled,
                    ))
                    .await?;
                self.stores
                    .subscriptions
                    .cancel(&obj.id, canceled_at)
                    .await?
                    .ok_or_else(|| {
                        IngestError::MissingReference(format!("subscription {}", obj.id))
                    })?
            }
        };

        tracing::info!(
            user_id = %subscription.user_id,
            provider_subscription_id = %subscription.provider_subscription_id,
            "subscription canceled"
        );

        Ok(ReconcileOutcome {
            user_id: Some(subscription.user_id),
            data: json!({
                "provider_subscription_id": subscription.provider_subscription_id,
                "canceled_at": subscription
                    .canceled_at
                    .map(OffsetDateTime::unix_timestamp),
            }),
            cache: CacheAction::Invalidate(subscription.user_id),
        })
    }

    /// Notification only. No local state changes until the trial actually
    /// converts or lapses, which arrive as their own events.
    async fn trial_will_end(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.subscription()?;
        let user_id = self.resolve_user(&obj.metadata, Some(&obj.customer)).await?;

        tracing::info!(
            user_id = %user_id,
            provider_subscription_id = %obj.id,
            trial_end = ?obj.trial_end,
            "trial ending soon"
        );

        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_subscription_id": obj.id,
                "trial_end": obj.trial_end,
            }),
            cache: CacheAction::None,
        })
    }

    async fn invoice_paid(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.invoice()?;
        let user_id = self.resolve_user(&obj.metadata, Some(&obj.customer)).await?;
        let amount = obj.amount_paid.or(obj.amount_due).unwrap_or(0);
        let currency = obj.currency.clone().unwrap_or_else(|| "usd".to_string());

        let recorded = self
            .stores
            .billing_history
            .insert_if_absent(BillingHistoryInsert {
                user_id,
                provider_invoice_id: obj.id.clone(),
                amount,
                currency: currency.clone(),
                status: "paid".to_string(),
                period_start: obj.period_start.and_then(from_unix),
                period_end: obj.period_end.and_then(from_unix),
                hosted_invoice_url: obj.hosted_invoice_url.clone(),
                invoice_pdf_url: obj.invoice_pdf.clone(),
            })
            .await?;

        if recorded {
            tracing::info!(
                user_id = %user_id,
                provider_invoice_id = %obj.id,
                amount,
                "recorded paid invoice"
            );
        } else {
            tracing::info!(
                provider_invoice_id = %obj.id,
                "invoice already in billing history, left untouched"
            );
        }

        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_invoice_id": obj.id,
                "amount": amount,
                "currency": currency,
                "recorded": recorded,
            }),
            cache: CacheAction::Invalidate(user_id),
        })
    }

    async fn invoice_failed(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.invoice()?;
        let user_id = self.resolve_user(&obj.metadata, Some(&obj.customer)).await?;
        let amount = obj.amount_due.or(obj.amount_paid).unwrap_or(0);
        let currency = obj.currency.clone().unwrap_or_else(|| "usd".to_string());

        self.stores
            .billing_history
            .insert_if_absent(BillingHistoryInsert {
                user_id,
                provider_invoice_id: obj.id.clone(),
                amount,
                currency: currency.clone(),
                status: "failed".to_string(),
                period_start: obj.period_start.and_then(from_unix),
                period_end: obj.period_end.and_then(from_unix),
                hosted_invoice_url: obj.hosted_invoice_url.clone(),
                invoice_pdf_url: obj.invoice_pdf.clone(),
            })
            .await?;

        // The delinquency shows on the subscription itself so reads do not
        // need to scan history.
        if let Some(provider_subscription_id) = &obj.subscription {
            match self
                .stores
                .subscriptions
                .mark_past_due(provider_subscription_id)
                .await?
            {
                Some(_) => tracing::warn!(
                    user_id = %user_id,
                    provider_subscription_id = %provider_subscription_id,
                    "invoice payment failed, subscription marked past_due"
                ),
                None => tracing::warn!(
                    user_id = %user_id,
                    provider_subscription_id = %provider_subscription_id,
                    "invoice payment failed for subscription not on record"
                ),
            }
        }

        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_invoice_id": obj.id,
                "provider_subscription_id": obj.subscription,
                "amount": amount,
                "currency": currency,
            }),
            cache: CacheAction::Invalidate(user_id),
        })
    }

    async fn settle_payment_intent(
        &self,
        event: &ProviderEvent,
        status: PaymentIntentStatus,
    ) -> IngestResult<ReconcileOutcome> {
        let obj = event.payment_intent()?;
        let user_id = self
            .resolve_user(&obj.metadata, obj.customer.as_deref())
            .await?;

        let intent = self
            .stores
            .payment_intents
            .upsert(PaymentIntentUpsert {
                provider_intent_id: obj.id.clone(),
                user_id,
                amount: obj.amount,
                currency: obj.currency.clone(),
                status,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            provider_intent_id = %intent.provider_intent_id,
            amount = intent.amount,
            status = intent.status.as_str(),
            "settled payment intent"
        );

        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_intent_id": intent.provider_intent_id,
                "amount": intent.amount,
                "currency": intent.currency,
                "status": intent.status.as_str(),
            }),
            cache: CacheAction::None,
        })
    }

    async fn attach_payment_method(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.payment_method()?;
        let user_id = self
            .resolve_user(&obj.metadata, obj.customer.as_deref())
            .await?;
        let is_default = obj.is_default
            || obj
                .metadata
                .get("default")
                .map(|v| v == "true")
                .unwrap_or(false);

        let method = self
            .stores
            .payment_methods
            .upsert(PaymentMethodUpsert {
                user_id,
                provider_method_id: obj.id.clone(),
                kind: obj.kind.clone(),
                brand: obj.card.as_ref().and_then(|c| c.brand.clone()),
                last4: obj.card.as_ref().and_then(|c| c.last4.clone()),
                is_default,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            provider_method_id = %method.provider_method_id,
            is_default = method.is_default,
            "attached payment method"
        );

        Ok(ReconcileOutcome {
            user_id: Some(user_id),
            data: json!({
                "provider_method_id": method.provider_method_id,
                "kind": method.kind,
                "brand": method.brand,
                "last4": method.last4,
                "is_default": method.is_default,
            }),
            cache: CacheAction::None,
        })
    }

    async fn detach_payment_method(&self, event: &ProviderEvent) -> IngestResult<ReconcileOutcome> {
        let obj = event.payment_method()?;
        // The provider clears `customer` on detach, so attribution is best
        // effort here.
        let user_id = self
            .try_resolve_user(&obj.metadata, obj.customer.as_deref())
            .await?;
        let removed = self.stores.payment_methods.remove(&obj.id).await?;

        tracing::info!(
            provider_method_id = %obj.id,
            removed,
            "detached payment method"
        );

        Ok(ReconcileOutcome {
            user_id,
            data: json!({
                "provider_method_id": obj.id,
                "removed": removed,
            }),
            cache: CacheAction::None,
        })
    }

    async fn record_dispute(
        &self,
        event: &ProviderEvent,
        kind: EventKind,
    ) -> IngestResult<ReconcileOutcome> {
        let obj = event.dispute()?;
        let provider_intent_id = obj
            .payment_intent
            .as_deref()
            .ok_or(IngestError::MissingField("payment_intent"))?;

        let intent = self
            .stores
            .payment_intents
            .get(provider_intent_id)
            .await?
            .ok_or_else(|| {
                IngestError::MissingReference(format!("payment intent {provider_intent_id}"))
            })?;

        match kind {
            EventKind::DisputeCreated => tracing::warn!(
                user_id = %intent.user_id,
                provider_dispute_id = %obj.id,
                provider_intent_id = %intent.provider_intent_id,
                amount = obj.amount,
                reason = ?obj.reason,
                "dispute opened against payment intent"
            ),
            _ => tracing::info!(
                user_id = %intent.user_id,
                provider_dispute_id = %obj.id,
                status = ?obj.status,
                "dispute closed"
            ),
        }

        Ok(ReconcileOutcome {
            user_id: Some(intent.user_id),
            data: json!({
                "provider_dispute_id": obj.id,
                "provider_intent_id": intent.provider_intent_id,
                "amount": obj.amount,
                "currency": obj.currency,
                "status": obj.status,
                "reason": obj.reason,
            }),
            cache: CacheAction::None,
        })
    }
}
