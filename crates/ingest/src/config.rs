//! Pipeline configuration
//!
//! All knobs come from the environment, with defaults that match what the
//! provider documents (5 minute signature tolerance) and what operations
//! expects (30 minute stuck-processing timeout).

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for webhook signature verification. May carry the
    /// provider's `whsec_` prefix; the verifier strips it.
    pub webhook_secret: String,
    /// Maximum age (and future skew) of the signature timestamp, in seconds.
    pub tolerance_secs: i64,
    /// How long a ledger record may sit in `processing` before the reaper
    /// reclaims it.
    pub processing_timeout_secs: i64,
    /// Retry worker gives up on a retryable failure after this many attempts.
    pub max_retry_attempts: i32,
    /// TTL for refreshed subscription summary projections.
    pub cache_ttl_secs: u64,
    /// Prefix for outbound bus channels (`<prefix>:<event_type>`).
    pub channel_prefix: String,
}

impl Config {
    pub fn from_env() -> IngestResult<Self> {
        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| IngestError::Config("WEBHOOK_SECRET must be set".to_string()))?;

        Ok(Self {
            webhook_secret,
            tolerance_secs: env_i64("WEBHOOK_TOLERANCE_SECS", 300),
            processing_timeout_secs: env_i64("PROCESSING_TIMEOUT_SECS", 1800),
            max_retry_attempts: env_i64("MAX_RETRY_ATTEMPTS", 5) as i32,
            cache_ttl_secs: env_i64("CACHE_TTL_SECS", 300) as u64,
            channel_prefix: std::env::var("EVENT_CHANNEL_PREFIX")
                .unwrap_or_else(|_| "payment".to_string()),
        })
    }

    /// Fixed configuration for tests and embedded use.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: secret.into(),
            tolerance_secs: 300,
            processing_timeout_secs: 1800,
            max_retry_attempts: 5,
            cache_ttl_secs: 300,
            channel_prefix: "payment".to_string(),
        }
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
