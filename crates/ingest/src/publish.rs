//! Domain event publication
//!
//! One normalized outbound event per reconciled inbound event, published on
//! `<prefix>:<event_type>` (e.g. `payment:subscription.created`). Delivery
//! is at-least-once: the Redis publisher retries with exponential backoff,
//! and a failure after retries is logged by the pipeline but never blocks or
//! reverses the committed state write. Consumers must tolerate duplicates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Normalized event handed to downstream consumers. Ephemeral; never
/// persisted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub user_id: Option<Uuid>,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
    /// Opaque id threaded unchanged from ingestion for tracing.
    pub correlation_id: String,
}

impl DomainEvent {
    pub fn new(
        event_type: &str,
        user_id: Option<Uuid>,
        data: serde_json::Value,
        correlation_id: &str,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            user_id,
            data,
            timestamp: OffsetDateTime::now_utc(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, event: &DomainEvent) -> IngestResult<()>;
}

/// Redis pub/sub publisher with exponential backoff.
#[derive(Clone)]
pub struct RedisEventBus {
    conn: ConnectionManager,
}

impl RedisEventBus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> IngestResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| IngestError::Bus(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| IngestError::Bus(e.to_string()))?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, event: &DomainEvent) -> IngestResult<()> {
        let payload =
            serde_json::to_string(event).map_err(|e| IngestError::Bus(e.to_string()))?;

        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
        let conn = self.conn.clone();

        Retry::spawn(strategy, move || {
            let mut conn = conn.clone();
            let channel = channel.to_string();
            let payload = payload.clone();
            async move { conn.publish::<_, _, i64>(channel, payload).await }
        })
        .await
        .map_err(|e| IngestError::Bus(e.to_string()))?;

        Ok(())
    }
}

/// In-memory recording bus for tests and single-node development.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    published: Arc<RwLock<Vec<(String, DomainEvent)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, DomainEvent)> {
        self.published.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.published.read().await.len()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, channel: &str, event: &DomainEvent) -> IngestResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngestError::Bus("bus unavailable".to_string()));
        }
        self.published
            .write()
            .await
            .push((channel.to_string(), event.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_published_events() {
        let bus = InMemoryBus::new();
        let event = DomainEvent::new(
            "subscription.created",
            Some(Uuid::new_v4()),
            serde_json::json!({"tier": "pro"}),
            "corr-1",
        );
        bus.publish("payment:subscription.created", &event)
            .await
            .unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "payment:subscription.created");
        assert_eq!(published[0].1.correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn failing_bus_returns_bus_error() {
        let bus = InMemoryBus::new();
        bus.set_failing(true);
        let event = DomainEvent::new("trial.will_end", None, serde_json::json!({}), "corr-2");
        let err = bus.publish("payment:trial.will_end", &event).await;
        assert!(matches!(err, Err(IngestError::Bus(_))));
        assert_eq!(bus.count().await, 0);
    }

    #[test]
    fn domain_event_serializes_with_unix_timestamp() {
        let event = DomainEvent::new("dispute.created", None, serde_json::json!({}), "corr-3");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert!(json["timestamp"].is_i64());
        assert_eq!(json["event_type"], "dispute.created");
    }
}
