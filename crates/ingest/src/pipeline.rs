//! Ingestion pipeline
//!
//! The full path of one webhook delivery: verify the signature over the raw
//! bytes, decode the envelope, claim the event in the ledger, reconcile, then
//! refresh the projection cache and publish the domain event. The ledger is
//! the only synchronization point; the cache and bus are best-effort side
//! channels whose failures never affect the recorded outcome.
//!
//! Every delivery of a well-formed, verified event is acknowledged, whatever
//! happens downstream. Failures are recorded in the ledger and retried from
//! there, never by asking the provider to redeliver.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::ProjectionCache;
use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::event::ProviderEvent;
use crate::model::EventStatus;
use crate::publish::{DomainEvent, EventBus};
use crate::reconcile::{CacheAction, ReconcileOutcome, Reconciler};
use crate::router::{route, EventKind};
use crate::store::Stores;
use crate::verify::SignatureVerifier;

/// What the transport should tell the provider about one delivery. Every
/// variant is an acknowledgement; only an `Err` from [`Pipeline::handle`]
/// warrants a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Reconciled, cache updated, domain event published.
    Processed,
    /// Already recorded as processed or currently in flight elsewhere.
    Duplicate,
    /// A type this service does not handle; recorded and dropped.
    Ignored,
    /// Handler failed; the failure is in the ledger for the retry worker.
    Failed { retryable: bool },
}

pub struct Pipeline {
    config: Config,
    verifier: SignatureVerifier,
    stores: Stores,
    reconciler: Reconciler,
    cache: Arc<dyn ProjectionCache>,
    bus: Arc<dyn EventBus>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        stores: Stores,
        cache: Arc<dyn ProjectionCache>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let verifier = SignatureVerifier::new(&config.webhook_secret, config.tolerance_secs);
        let reconciler = Reconciler::new(stores.clone());
        Self {
            config,
            verifier,
            stores,
            reconciler,
            cache,
            bus,
        }
    }

    /// Ingest one raw delivery. Returns `Err` only when nothing was
    /// persisted and the provider should redeliver: a bad signature, an
    /// undecodable envelope, or a ledger insert that never happened.
    pub async fn handle(
        &self,
        raw: &[u8],
        signature_header: &str,
        correlation_id: Option<&str>,
    ) -> IngestResult<AckOutcome> {
        let correlation_id = correlation_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.verifier
            .verify(raw, signature_header, OffsetDateTime::now_utc())?;
        let event = ProviderEvent::decode(raw)?;

        // Valid UTF-8 is implied by the successful decode.
        let payload = String::from_utf8_lossy(raw).into_owned();
        let outcome = self
            .stores
            .ledger
            .record_if_new(&event.id, &event.event_type, &payload)
            .await?;

        if !outcome.is_new {
            // A redelivery may only re-run a stalled insert or a transient
            // failure. Permanent failures wait for an operator resubmit.
            let rerunnable = match outcome.record.status {
                EventStatus::Received => true,
                EventStatus::Failed => outcome.record.retryable,
                EventStatus::Processed | EventStatus::Processing => false,
            };
            if !rerunnable {
                tracing::info!(
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    status = %outcome.record.status,
                    retryable = outcome.record.retryable,
                    correlation_id = %correlation_id,
                    "duplicate delivery, acknowledged without processing"
                );
                return Ok(AckOutcome::Duplicate);
            }
        }

        // The guarded claim decides races between concurrent deliveries of
        // the same event; exactly one caller proceeds.
        if !self.stores.ledger.mark_processing(&event.id).await? {
            tracing::info!(
                provider_event_id = %event.id,
                correlation_id = %correlation_id,
                "lost claim to a concurrent delivery"
            );
            return Ok(AckOutcome::Duplicate);
        }

        Ok(self.process_claimed(&event, &correlation_id).await)
    }

    /// Re-run a previously failed event from its stored payload. Used by the
    /// retry worker and by operators replaying a specific event.
    pub async fn resubmit(&self, provider_event_id: &str) -> IngestResult<AckOutcome> {
        let record = self
            .stores
            .ledger
            .get(provider_event_id)
            .await?
            .ok_or_else(|| IngestError::EventNotFound(provider_event_id.to_string()))?;

        if record.status == EventStatus::Processed {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "already processed".to_string(),
            });
        }
        if !self.stores.ledger.mark_processing(provider_event_id).await? {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "currently in flight".to_string(),
            });
        }

        let correlation_id = Uuid::new_v4().to_string();
        let event = match ProviderEvent::decode(record.payload.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                // A stored payload that no longer decodes will never decode.
                let error = IngestError::from(e);
                self.record_failure(provider_event_id, &error, &correlation_id)
                    .await;
                return Ok(AckOutcome::Failed { retryable: false });
            }
        };

        tracing::info!(
            provider_event_id = %provider_event_id,
            event_type = %event.event_type,
            attempts = record.attempts,
            correlation_id = %correlation_id,
            "resubmitting event from ledger"
        );

        Ok(self.process_claimed(&event, &correlation_id).await)
    }

    /// Runs a claimed event to a terminal ledger status. Infallible by
    /// construction: every outcome, including handler failure, is recorded
    /// and acknowledged.
    async fn process_claimed(&self, event: &ProviderEvent, correlation_id: &str) -> AckOutcome {
        let kind = match route(&event.event_type) {
            Some(kind) => kind,
            None => {
                if let Err(e) = self.stores.ledger.mark_processed(&event.id).await {
                    tracing::error!(
                        provider_event_id = %event.id,
                        error = %e,
                        "failed to mark unhandled event processed"
                    );
                }
                tracing::info!(
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    correlation_id = %correlation_id,
                    "unhandled event type, acknowledged and dropped"
                );
                return AckOutcome::Ignored;
            }
        };

        match self.reconciler.apply(kind, event).await {
            Ok(outcome) => {
                if let Err(e) = self.stores.ledger.mark_processed(&event.id).await {
                    tracing::error!(
                        provider_event_id = %event.id,
                        error = %e,
                        "reconciled but failed to mark processed"
                    );
                }
                self.finish(kind, event, &outcome, correlation_id).await;
                AckOutcome::Processed
            }
            Err(error) => {
                tracing::warn!(
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    error = %error,
                    retryable = error.is_retryable(),
                    correlation_id = %correlation_id,
                    "reconciliation failed"
                );
                let retryable = error.is_retryable();
                self.record_failure(&event.id, &error, correlation_id).await;
                AckOutcome::Failed { retryable }
            }
        }
    }

    /// Post-commit side effects. Failures here are warnings, never ledger
    /// state.
    async fn finish(
        &self,
        kind: EventKind,
        event: &ProviderEvent,
        outcome: &ReconcileOutcome,
        correlation_id: &str,
    ) {
        match &outcome.cache {
            CacheAction::None => {}
            CacheAction::Invalidate(user_id) => {
                if let Err(e) = self.cache.invalidate(*user_id).await {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "cache invalidation failed, projection may be stale until TTL"
                    );
                }
            }
            CacheAction::Refresh(user_id, snapshot) => {
                if let Err(e) = self
                    .cache
                    .refresh(*user_id, snapshot, self.config.cache_ttl_secs)
                    .await
                {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "cache refresh failed, projection may be stale until TTL"
                    );
                }
            }
        }

        let domain_event = DomainEvent::new(
            kind.domain_event_type(),
            outcome.user_id,
            outcome.data.clone(),
            correlation_id,
        );
        let channel = format!(
            "{}:{}",
            self.config.channel_prefix,
            domain_event.event_type
        );
        if let Err(e) = self.bus.publish(&channel, &domain_event).await {
            tracing::warn!(
                provider_event_id = %event.id,
                channel = %channel,
                error = %e,
                "domain event publication failed"
            );
        } else {
            tracing::debug!(
                provider_event_id = %event.id,
                channel = %channel,
                correlation_id = %correlation_id,
                "published domain event"
            );
        }
    }

    async fn record_failure(
        &self,
        provider_event_id: &str,
        error: &IngestError,
        correlation_id: &str,
    ) {
        if let Err(e) = self
            .stores
            .ledger
            .mark_failed(provider_event_id, &error.to_string(), error.is_retryable())
            .await
        {
            tracing::error!(
                provider_event_id = %provider_event_id,
                error = %e,
                correlation_id = %correlation_id,
                "failed to record failure in ledger"
            );
        }
    }
}
