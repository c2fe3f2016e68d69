//! Provider event envelope and typed payloads
//!
//! Events arrive as a JSON envelope `{id, type, created, data: {object}}`.
//! The envelope is decoded from the exact raw bytes only after signature
//! verification. The inner object is kept as raw JSON until routing has
//! decided which family it belongs to, then decoded into the typed payload
//! for that family.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// The inbound envelope. `data.object` stays untyped until routed.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    /// The provider's unique event id, the ledger's natural key.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time, unix seconds.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn decode(raw: &[u8]) -> IngestResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn subscription(&self) -> IngestResult<SubscriptionObject> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }

    pub fn invoice(&self) -> IngestResult<InvoiceObject> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }

    pub fn payment_intent(&self) -> IngestResult<PaymentIntentObject> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }

    pub fn payment_method(&self) -> IngestResult<PaymentMethodObject> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }

    pub fn dispute(&self) -> IngestResult<DisputeObject> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub trial_end: Option<i64>,
    pub plan: Option<PlanObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanObject {
    pub id: String,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub amount_paid: Option<i64>,
    pub amount_due: Option<i64>,
    pub currency: Option<String>,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentMethodObject {
    pub id: String,
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub card: Option<CardObject>,
    /// Whether this method should become the user's default. Not part of the
    /// provider's canonical object; set by our checkout flow via metadata or
    /// this flag.
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardObject {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeObject {
    pub id: String,
    pub payment_intent: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: Option<String>,
    pub reason: Option<String>,
}

/// Pull an internal user id out of payload metadata, if the checkout flow
/// stamped one there.
pub fn metadata_user_id(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata.get("user_id").and_then(|v| Uuid::parse_str(v).ok())
}

/// Unix seconds to `OffsetDateTime`, dropping values outside the valid range.
pub fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Like `from_unix` but for required fields.
pub fn require_unix(ts: i64, field: &'static str) -> IngestResult<OffsetDateTime> {
    from_unix(ts).ok_or(IngestError::MissingField(field))
}
