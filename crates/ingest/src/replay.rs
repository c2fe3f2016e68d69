//! Failure recovery
//!
//! Two background concerns over the ledger: reclaiming records stuck in
//! `processing` after a crash, and resubmitting retryable failures. Both run
//! from the worker on a schedule; neither touches the provider.

use std::sync::Arc;

use time::Duration;

use crate::config::Config;
use crate::error::{IngestError, IngestResult};
use crate::pipeline::{AckOutcome, Pipeline};
use crate::store::Stores;

/// Counters from one retry sweep, for the worker's summary log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryRunSummary {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
    /// Records another worker claimed between listing and resubmitting.
    pub skipped: usize,
}

pub struct ReplayService {
    pipeline: Arc<Pipeline>,
    stores: Stores,
    config: Config,
}

impl ReplayService {
    pub fn new(pipeline: Arc<Pipeline>, stores: Stores, config: Config) -> Self {
        Self {
            pipeline,
            stores,
            config,
        }
    }

    /// Move records stuck in `processing` past the timeout back to a
    /// retryable `failed`, where the next sweep picks them up.
    pub async fn reclaim_stuck(&self) -> IngestResult<u64> {
        let reclaimed = self
            .stores
            .ledger
            .reclaim_stuck(Duration::seconds(self.config.processing_timeout_secs))
            .await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "reclaimed stuck processing records");
        }
        Ok(reclaimed)
    }

    /// Resubmit up to `limit` retryable failures below the attempt ceiling,
    /// oldest first. A record that fails again stays in the ledger with its
    /// attempt count bumped; once it crosses the ceiling the sweep stops
    /// listing it and it waits for an operator.
    pub async fn retry_failed(&self, limit: i64) -> IngestResult<RetryRunSummary> {
        let records = self
            .stores
            .ledger
            .list_retryable(self.config.max_retry_attempts, limit)
            .await?;

        let mut summary = RetryRunSummary {
            attempted: records.len(),
            ..Default::default()
        };

        for record in records {
            match self.pipeline.resubmit(&record.provider_event_id).await {
                Ok(AckOutcome::Processed | AckOutcome::Ignored) => summary.processed += 1,
                Ok(AckOutcome::Duplicate) => summary.skipped += 1,
                Ok(AckOutcome::Failed { .. }) => summary.failed += 1,
                Err(IngestError::InvalidTransition { .. }) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        provider_event_id = %record.provider_event_id,
                        error = %e,
                        "retry sweep could not resubmit record"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                "retry sweep finished"
            );
        }
        Ok(summary)
    }
}
