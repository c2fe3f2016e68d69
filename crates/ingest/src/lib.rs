// Ingest crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // IngestError carries payload context strings
#![allow(clippy::too_many_arguments)] // Upsert parameter structs mirror provider payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Payment webhook ingestion and reconciliation
//!
//! Receives signed webhook deliveries from the payment provider and converges
//! local billing state toward what they describe, exactly once per event.
//!
//! ## Pipeline
//!
//! - **Verification**: HMAC-SHA256 over the exact raw bytes, constant-time
//!   compare, bounded timestamp age
//! - **Deduplication**: an append-only ledger keyed by the provider event id;
//!   an atomic check-and-insert plus a guarded claim decide redeliveries and
//!   races
//! - **Reconciliation**: idempotent upsert-by-natural-key handlers per event
//!   family (subscriptions, invoices, payment intents, payment methods,
//!   disputes)
//! - **Projection**: a cached per-user subscription summary invalidated or
//!   refreshed after each committed write
//! - **Publication**: one normalized domain event per reconciled delivery on
//!   `payment:<event_type>`, at-least-once
//! - **Recovery**: failed records are retried from the ledger by a background
//!   sweep; stuck claims are reclaimed by a reaper

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod postgres;
pub mod publish;
pub mod reconcile;
pub mod replay;
pub mod router;
pub mod store;
pub mod verify;

#[cfg(test)]
mod pipeline_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Cache
pub use cache::{
    InMemoryProjectionCache, ProjectionCache, RedisProjectionCache, SubscriptionSnapshot,
};

// Config
pub use config::Config;

// Error
pub use error::{IngestError, IngestResult};

// Event
pub use event::ProviderEvent;

// Model
pub use model::{
    BillingHistoryEntry, EventStatus, LedgerRecord, PaymentIntent, PaymentMethod, Subscription,
    SubscriptionStatus,
};

// Pipeline
pub use pipeline::{AckOutcome, Pipeline};

// Publish
pub use publish::{DomainEvent, EventBus, InMemoryBus, RedisEventBus};

// Replay
pub use replay::{ReplayService, RetryRunSummary};

// Router
pub use router::{handled_types, route, EventKind};

// Store
pub use store::Stores;

// Verify
pub use verify::SignatureVerifier;

/// Everything a transport or worker needs, wired together.
pub struct IngestService {
    pub pipeline: Arc<Pipeline>,
    pub replay: ReplayService,
    pub stores: Stores,
    pub config: Config,
}

impl IngestService {
    /// Create the service from environment variables, with Postgres as the
    /// store and Redis as cache and bus.
    pub async fn from_env(pool: PgPool) -> IngestResult<Self> {
        let config = Config::from_env()?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| IngestError::Config("REDIS_URL must be set".to_string()))?;

        let cache = RedisProjectionCache::connect(&redis_url).await?;
        let bus = RedisEventBus::connect(&redis_url).await?;
        Ok(Self::new(config, pool, Arc::new(cache), Arc::new(bus)))
    }

    /// Create the service with explicit config and side channels.
    pub fn new(
        config: Config,
        pool: PgPool,
        cache: Arc<dyn ProjectionCache>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let stores = postgres::PgStores::new(pool).into_stores();
        Self::with_stores(config, stores, cache, bus)
    }

    /// Create the service over arbitrary store backends. Used by tests and
    /// single-node development with the in-memory stores.
    pub fn with_stores(
        config: Config,
        stores: Stores,
        cache: Arc<dyn ProjectionCache>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            stores.clone(),
            cache,
            bus,
        ));
        let replay = ReplayService::new(pipeline.clone(), stores.clone(), config.clone());
        Self {
            pipeline,
            replay,
            stores,
            config,
        }
    }
}
