//! Read-side projection cache
//!
//! A cached subscription summary keyed by user id, kept consistent with the
//! relational store by invalidating or refreshing after every committed
//! reconciliation. The cache is a best-effort side channel: a failure here
//! is surfaced as a warning by the pipeline and never rolls back or fails
//! the already-committed write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::model::{Subscription, SubscriptionStatus};

/// The cached read projection of a user's subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub user_id: Uuid,
    pub tier: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::timestamp::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    pub fn from_subscription(subscription: &Subscription) -> Self {
        Self {
            user_id: subscription.user_id,
            tier: subscription.tier.clone(),
            status: subscription.status,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

fn summary_key(user_id: Uuid) -> String {
    format!("billing:summary:{user_id}")
}

#[async_trait]
pub trait ProjectionCache: Send + Sync {
    /// Drop the cached summary so the next read repopulates from the store.
    async fn invalidate(&self, user_id: Uuid) -> IngestResult<()>;

    /// Replace the cached summary with a just-committed snapshot.
    async fn refresh(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        ttl_secs: u64,
    ) -> IngestResult<()>;
}

#[derive(Clone)]
pub struct RedisProjectionCache {
    conn: ConnectionManager,
}

impl RedisProjectionCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> IngestResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| IngestError::Cache(e.to_string()))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl ProjectionCache for RedisProjectionCache {
    async fn invalidate(&self, user_id: Uuid) -> IngestResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, i64>(summary_key(user_id)).await?;
        Ok(())
    }

    async fn refresh(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        ttl_secs: u64,
    ) -> IngestResult<()> {
        let payload =
            serde_json::to_string(snapshot).map_err(|e| IngestError::Cache(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(summary_key(user_id), payload, ttl_secs)
            .await?;
        Ok(())
    }
}

/// In-memory projection cache for tests and single-node development.
/// TTLs are not enforced; tests assert on presence, not expiry.
#[derive(Clone, Default)]
pub struct InMemoryProjectionCache {
    entries: Arc<RwLock<HashMap<Uuid, SubscriptionSnapshot>>>,
}

impl InMemoryProjectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, user_id: Uuid) -> Option<SubscriptionSnapshot> {
        self.entries.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl ProjectionCache for InMemoryProjectionCache {
    async fn invalidate(&self, user_id: Uuid) -> IngestResult<()> {
        self.entries.write().await.remove(&user_id);
        Ok(())
    }

    async fn refresh(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        _ttl_secs: u64,
    ) -> IngestResult<()> {
        self.entries.write().await.insert(user_id, snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keys_are_namespaced_by_user() {
        let user_id = Uuid::nil();
        assert_eq!(
            summary_key(user_id),
            "billing:summary:00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn refresh_then_invalidate() {
        let cache = InMemoryProjectionCache::new();
        let user_id = Uuid::new_v4();
        let snapshot = SubscriptionSnapshot {
            user_id,
            tier: "pro".to_string(),
            status: SubscriptionStatus::Active,
            current_period_end: None,
            cancel_at_period_end: false,
        };

        cache.refresh(user_id, &snapshot, 300).await.unwrap();
        assert!(cache.snapshot(user_id).await.is_some());

        cache.invalidate(user_id).await.unwrap();
        assert!(cache.snapshot(user_id).await.is_none());
    }
}
