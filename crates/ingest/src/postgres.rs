//! Postgres store implementations
//!
//! The ledger's `INSERT ... ON CONFLICT DO NOTHING RETURNING` is the atomic
//! claim that makes deduplication safe under concurrent delivery; entity
//! writes are `ON CONFLICT (natural_key) DO UPDATE` upserts so redelivery
//! resolves to the same row. Guarded `UPDATE ... WHERE status IN (...)`
//! keeps ledger transitions monotonic without advisory locks.

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::model::{
    BillingHistoryEntry, BillingHistoryInsert, EventStatus, LedgerRecord, PaymentIntent,
    PaymentIntentStatus, PaymentIntentUpsert, PaymentMethod, PaymentMethodUpsert, Subscription,
    SubscriptionStatus, SubscriptionUpsert,
};
use crate::store::{
    BillingHistoryStore, EventLedger, PaymentIntentStore, PaymentMethodStore, RecordOutcome,
    Stores, SubscriptionStore,
};

/// All stores backed by one connection pool.
#[derive(Clone)]
pub struct PgStores {
    pool: PgPool,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bundle this backend into the trait handles the pipeline consumes.
    pub fn into_stores(self) -> Stores {
        let shared = std::sync::Arc::new(self);
        Stores {
            ledger: shared.clone(),
            subscriptions: shared.clone(),
            payment_intents: shared.clone(),
            payment_methods: shared.clone(),
            billing_history: shared,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    provider_event_id: String,
    event_type: String,
    payload: String,
    status: String,
    error: Option<String>,
    retryable: bool,
    attempts: i32,
    received_at: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
}

impl LedgerRow {
    fn into_record(self) -> IngestResult<LedgerRecord> {
        let status = EventStatus::parse(&self.status).ok_or_else(|| {
            IngestError::Store(format!(
                "corrupt ledger status {:?} for event {}",
                self.status, self.provider_event_id
            ))
        })?;
        Ok(LedgerRecord {
            id: self.id,
            provider_event_id: self.provider_event_id,
            event_type: self.event_type,
            payload: self.payload,
            status,
            error: self.error,
            retryable: self.retryable,
            attempts: self.attempts,
            received_at: self.received_at,
            processing_started_at: self.processing_started_at,
            processed_at: self.processed_at,
        })
    }
}

const LEDGER_COLUMNS: &str = "id, provider_event_id, event_type, payload, status, error, \
     retryable, attempts, received_at, processing_started_at, processed_at";

#[async_trait]
impl EventLedger for PgStores {
    async fn record_if_new(
        &self,
        provider_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> IngestResult<RecordOutcome> {
        // Atomic check-and-insert: only one concurrent delivery gets a row
        // back from the insert; everyone else sees the existing record.
        let inserted: Option<LedgerRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events
                (id, provider_event_id, event_type, payload, status, retryable, attempts, received_at)
            VALUES ($1, $2, $3, $4, 'received', false, 0, NOW())
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(provider_event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(RecordOutcome {
                is_new: true,
                record: row.into_record()?,
            });
        }

        let existing: LedgerRow = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM webhook_events WHERE provider_event_id = $1"
        ))
        .bind(provider_event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecordOutcome {
            is_new: false,
            record: existing.into_record()?,
        })
    }

    async fn mark_processing(&self, provider_event_id: &str) -> IngestResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processing', processing_started_at = NOW()
            WHERE provider_event_id = $1 AND status IN ('received', 'failed')
            "#,
        )
        .bind(provider_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, provider_event_id: &str) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = NOW(), error = NULL
            WHERE provider_event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(provider_event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "mark_processed outside of processing".to_string(),
            });
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        provider_event_id: &str,
        error: &str,
        retryable: bool,
    ) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', error = $2, retryable = $3, attempts = attempts + 1
            WHERE provider_event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(provider_event_id)
        .bind(error)
        .bind(retryable)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::InvalidTransition {
                event_id: provider_event_id.to_string(),
                detail: "mark_failed outside of processing".to_string(),
            });
        }
        Ok(())
    }

    async fn reclaim_stuck(&self, older_than: Duration) -> IngestResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed',
                error = 'processing timeout exceeded; reclaimed by reaper',
                retryable = true,
                attempts = attempts + 1
            WHERE status = 'processing'
              AND processing_started_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_seconds_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, provider_event_id: &str) -> IngestResult<Option<LedgerRecord>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM webhook_events WHERE provider_event_id = $1"
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerRow::into_record).transpose()
    }

    async fn list_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> IngestResult<Vec<LedgerRecord>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM webhook_events
            WHERE status = 'failed' AND retryable = true AND attempts < $1
            ORDER BY received_at ASC
            LIMIT $2
            "#
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_record).collect()
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    provider_subscription_id: String,
    provider_customer_id: String,
    tier: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    trial_end: Option<OffsetDateTime>,
    plan_id: Option<String>,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_subscription(self) -> IngestResult<Subscription> {
        let status = SubscriptionStatus::parse(&self.status).ok_or_else(|| {
            IngestError::Store(format!(
                "corrupt subscription status {:?} for {}",
                self.status, self.provider_subscription_id
            ))
        })?;
        Ok(Subscription {
            id: self.id,
            user_id: self.user_id,
            provider_subscription_id: self.provider_subscription_id,
            provider_customer_id: self.provider_customer_id,
            tier: self.tier,
            status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            trial_end: self.trial_end,
            plan_id: self.plan_id,
            canceled_at: self.canceled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, provider_subscription_id, provider_customer_id, \
     tier, status, current_period_start, current_period_end, cancel_at_period_end, trial_end, \
     plan_id, canceled_at, created_at, updated_at";

#[async_trait]
impl SubscriptionStore for PgStores {
    async fn upsert(&self, params: SubscriptionUpsert) -> IngestResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (id, user_id, provider_subscription_id, provider_customer_id, tier, status,
                 current_period_start, current_period_end, cancel_at_period_end, trial_end,
                 plan_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (provider_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                provider_customer_id = EXCLUDED.provider_customer_id,
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                trial_end = EXCLUDED.trial_end,
                plan_id = EXCLUDED.plan_id,
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(params.user_id)
        .bind(&params.provider_subscription_id)
        .bind(&params.provider_customer_id)
        .bind(&params.tier)
        .bind(params.status.as_str())
        .bind(params.current_period_start)
        .bind(params.current_period_end)
        .bind(params.cancel_at_period_end)
        .bind(params.trial_end)
        .bind(&params.plan_id)
        .fetch_one(&mut *tx)
        .await?;

        // One live subscription per user: demote any other live row inside
        // the same transaction.
        if params.status.is_live() {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', canceled_at = COALESCE(canceled_at, NOW()),
                    updated_at = NOW()
                WHERE user_id = $1
                  AND provider_subscription_id <> $2
                  AND status IN ('trialing', 'active', 'past_due')
                "#,
            )
            .bind(params.user_id)
            .bind(&params.provider_subscription_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.into_subscription()
    }

    async fn cancel(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> IngestResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                canceled_at = COALESCE(canceled_at, $2),
                cancel_at_period_end = false,
                updated_at = NOW()
            WHERE provider_subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(provider_subscription_id)
        .bind(canceled_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn mark_past_due(
        &self,
        provider_subscription_id: &str,
    ) -> IngestResult<Option<Subscription>> {
        // Guarded so a late-arriving invoice failure cannot resurrect a
        // canceled subscription.
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE provider_subscription_id = $1
              AND status IN ('trialing', 'active', 'past_due')
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn get(&self, provider_subscription_id: &str) -> IngestResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn find_user_by_customer(
        &self,
        provider_customer_id: &str,
    ) -> IngestResult<Option<Uuid>> {
        let user_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT user_id FROM subscriptions
            WHERE provider_customer_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(provider_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }
}

#[derive(sqlx::FromRow)]
struct PaymentIntentRow {
    id: Uuid,
    provider_intent_id: String,
    user_id: Uuid,
    amount: i64,
    currency: String,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl PaymentIntentRow {
    fn into_intent(self) -> IngestResult<PaymentIntent> {
        let status = PaymentIntentStatus::parse(&self.status).ok_or_else(|| {
            IngestError::Store(format!(
                "corrupt payment intent status {:?} for {}",
                self.status, self.provider_intent_id
            ))
        })?;
        Ok(PaymentIntent {
            id: self.id,
            provider_intent_id: self.provider_intent_id,
            user_id: self.user_id,
            amount: self.amount,
            currency: self.currency,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl PaymentIntentStore for PgStores {
    async fn upsert(&self, params: PaymentIntentUpsert) -> IngestResult<PaymentIntent> {
        let row: PaymentIntentRow = sqlx::query_as(
            r#"
            INSERT INTO payment_intents
                (id, provider_intent_id, user_id, amount, currency, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (provider_intent_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                updated_at = NOW()
            RETURNING id, provider_intent_id, user_id, amount, currency, status,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&params.provider_intent_id)
        .bind(params.user_id)
        .bind(params.amount)
        .bind(&params.currency)
        .bind(params.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.into_intent()
    }

    async fn get(&self, provider_intent_id: &str) -> IngestResult<Option<PaymentIntent>> {
        let row: Option<PaymentIntentRow> = sqlx::query_as(
            r#"
            SELECT id, provider_intent_id, user_id, amount, currency, status,
                   created_at, updated_at
            FROM payment_intents
            WHERE provider_intent_id = $1
            "#,
        )
        .bind(provider_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentIntentRow::into_intent).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    user_id: Uuid,
    provider_method_id: String,
    kind: String,
    brand: Option<String>,
    last4: Option<String>,
    is_default: bool,
    created_at: OffsetDateTime,
}

impl PaymentMethodRow {
    fn into_method(self) -> PaymentMethod {
        PaymentMethod {
            id: self.id,
            user_id: self.user_id,
            provider_method_id: self.provider_method_id,
            kind: self.kind,
            brand: self.brand,
            last4: self.last4,
            is_default: self.is_default,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl PaymentMethodStore for PgStores {
    async fn upsert(&self, params: PaymentMethodUpsert) -> IngestResult<PaymentMethod> {
        let mut tx = self.pool.begin().await?;

        // At most one default per user: clear the previous default in the
        // same transaction as the upsert.
        if params.is_default {
            sqlx::query(
                r#"
                UPDATE payment_methods
                SET is_default = false
                WHERE user_id = $1 AND provider_method_id <> $2 AND is_default = true
                "#,
            )
            .bind(params.user_id)
            .bind(&params.provider_method_id)
            .execute(&mut *tx)
            .await?;
        }

        let row: PaymentMethodRow = sqlx::query_as(
            r#"
            INSERT INTO payment_methods
                (id, user_id, provider_method_id, kind, brand, last4, is_default, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (provider_method_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                kind = EXCLUDED.kind,
                brand = EXCLUDED.brand,
                last4 = EXCLUDED.last4,
                is_default = EXCLUDED.is_default
            RETURNING id, user_id, provider_method_id, kind, brand, last4, is_default, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.user_id)
        .bind(&params.provider_method_id)
        .bind(&params.kind)
        .bind(&params.brand)
        .bind(&params.last4)
        .bind(params.is_default)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into_method())
    }

    async fn remove(&self, provider_method_id: &str) -> IngestResult<bool> {
        let result = sqlx::query("DELETE FROM payment_methods WHERE provider_method_id = $1")
            .bind(provider_method_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: Uuid) -> IngestResult<Vec<PaymentMethod>> {
        let rows: Vec<PaymentMethodRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_method_id, kind, brand, last4, is_default, created_at
            FROM payment_methods
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentMethodRow::into_method).collect())
    }
}

#[derive(sqlx::FromRow)]
struct BillingHistoryRow {
    id: Uuid,
    user_id: Uuid,
    provider_invoice_id: String,
    amount: i64,
    currency: String,
    status: String,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    hosted_invoice_url: Option<String>,
    invoice_pdf_url: Option<String>,
    created_at: OffsetDateTime,
}

#[async_trait]
impl BillingHistoryStore for PgStores {
    async fn insert_if_absent(&self, params: BillingHistoryInsert) -> IngestResult<bool> {
        // Create-once: existing entries are immutable, so conflicts are
        // dropped rather than updated.
        let result = sqlx::query(
            r#"
            INSERT INTO billing_history
                (id, user_id, provider_invoice_id, amount, currency, status,
                 period_start, period_end, hosted_invoice_url, invoice_pdf_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (provider_invoice_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.user_id)
        .bind(&params.provider_invoice_id)
        .bind(params.amount)
        .bind(&params.currency)
        .bind(&params.status)
        .bind(params.period_start)
        .bind(params.period_end)
        .bind(&params.hosted_invoice_url)
        .bind(&params.invoice_pdf_url)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, provider_invoice_id: &str) -> IngestResult<Option<BillingHistoryEntry>> {
        let row: Option<BillingHistoryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_invoice_id, amount, currency, status,
                   period_start, period_end, hosted_invoice_url, invoice_pdf_url, created_at
            FROM billing_history
            WHERE provider_invoice_id = $1
            "#,
        )
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BillingHistoryEntry {
            id: r.id,
            user_id: r.user_id,
            provider_invoice_id: r.provider_invoice_id,
            amount: r.amount,
            currency: r.currency,
            status: r.status,
            period_start: r.period_start,
            period_end: r.period_end,
            hosted_invoice_url: r.hosted_invoice_url,
            invoice_pdf_url: r.invoice_pdf_url,
            created_at: r.created_at,
        }))
    }
}
