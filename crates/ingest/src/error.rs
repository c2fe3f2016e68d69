//! Ingestion error types
//!
//! Every failure in the pipeline is either *permanent* (a bad payload will be
//! just as bad on the next attempt) or *transient* (a backing service was
//! unavailable and a retry may succeed). The retry worker only resubmits
//! ledger records whose failure was transient.

use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Signature missing, malformed, mismatched, or outside the tolerance
    /// window. Rejected before anything is persisted.
    #[error("webhook signature verification failed: {0}")]
    Verification(String),

    /// The raw payload could not be decoded into the provider envelope.
    #[error("failed to decode provider event: {0}")]
    Decode(#[from] serde_json::Error),

    /// A required field was absent from an otherwise well-formed payload.
    #[error("payload missing required field: {0}")]
    MissingField(&'static str),

    /// A field was present but carried a value this service does not
    /// recognize (for example an unknown subscription status).
    #[error("unrecognized value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// The payload references a user that cannot be resolved from metadata
    /// or from the provider customer id.
    #[error("no internal user for provider customer {0}")]
    UnknownUser(String),

    /// The payload references an entity that does not exist (for example a
    /// dispute against an unrecorded payment intent).
    #[error("referenced entity not found: {0}")]
    MissingReference(String),

    /// The storage layer rejected the write on a constraint. A retry would
    /// hit the same constraint, so this is permanent.
    #[error("storage constraint violated: {0}")]
    Constraint(String),

    /// The storage layer was unavailable or the query failed for reasons
    /// unrelated to the data. Retryable.
    #[error("storage error: {0}")]
    Store(String),

    /// The projection cache was unreachable. Never fails the pipeline; only
    /// surfaced as a warning.
    #[error("cache error: {0}")]
    Cache(String),

    /// The domain event bus was unreachable after retries.
    #[error("event bus error: {0}")]
    Bus(String),

    /// A ledger record was asked to make a transition its current status
    /// does not permit (for example resubmitting a `processed` event).
    #[error("invalid ledger transition for event {event_id}: {detail}")]
    InvalidTransition { event_id: String, detail: String },

    /// No ledger record exists for the requested provider event id.
    #[error("no ledger record for provider event {0}")]
    EventNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Whether a retry of the same payload could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Store(_) | IngestError::Cache(_) | IngestError::Bus(_)
        )
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        // Constraint violations are data problems, not availability problems.
        if let Some(db) = err.as_database_error() {
            use sqlx::error::ErrorKind;
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => {
                    return IngestError::Constraint(db.message().to_string());
                }
                _ => {}
            }
        }
        IngestError::Store(err.to_string())
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(err: redis::RedisError) -> Self {
        IngestError::Cache(err.to_string())
    }
}
