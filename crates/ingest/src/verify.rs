//! Webhook signature verification
//!
//! The provider signs every delivery with an HMAC-SHA256 over
//! `"{timestamp}.{raw body}"` and sends the result in a header of the form
//! `t=<unix seconds>,v1=<hex digest>`. Verification must run against the
//! exact raw bytes: re-serializing the JSON is not guaranteed byte-identical.
//!
//! No side effects; a rejected payload is never ledgered.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{IngestError, IngestResult};

type HmacSha256 = Hmac<Sha256>;

pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(webhook_secret: &str, tolerance_secs: i64) -> Self {
        // The dashboard-issued secret carries a "whsec_" prefix.
        let secret = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance_secs,
        }
    }

    /// Verify `signature_header` against the exact raw payload bytes.
    /// Returns the signature timestamp on success.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: OffsetDateTime,
    ) -> IngestResult<OffsetDateTime> {
        let (timestamp, received) = parse_signature_header(signature_header)?;

        let age = now.unix_timestamp() - timestamp;
        if age.abs() > self.tolerance_secs {
            return Err(IngestError::Verification(format!(
                "timestamp {timestamp} outside tolerance ({age}s old)"
            )));
        }

        let received = hex::decode(&received)
            .map_err(|_| IngestError::Verification("v1 signature is not hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| IngestError::Verification("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = mac.finalize().into_bytes();

        if !bool::from(expected.as_slice().ct_eq(&received)) {
            return Err(IngestError::Verification(
                "signature mismatch".to_string(),
            ));
        }

        OffsetDateTime::from_unix_timestamp(timestamp)
            .map_err(|_| IngestError::Verification("timestamp out of range".to_string()))
    }
}

/// Parse `t=<unix>,v1=<hex>`. Unknown scheme keys are ignored so the
/// provider can roll new schemes without breaking verification.
fn parse_signature_header(header: &str) -> IngestResult<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1 = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| IngestError::Verification("missing timestamp in header".to_string()))?;
    let v1 =
        v1.ok_or_else(|| IngestError::Verification("missing v1 signature in header".to_string()))?;

    Ok((timestamp, v1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={digest}")
    }

    #[test]
    fn accepts_valid_signature() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, now.unix_timestamp());
        assert!(verifier.verify(payload, &header, now).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let header = sign(br#"{"id":"evt_1"}"#, now.unix_timestamp());
        let result = verifier.verify(br#"{"id":"evt_2"}"#, &header, now);
        assert!(matches!(result, Err(IngestError::Verification(_))));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let payload = br#"{"id":"evt_1"}"#;
        // 301 seconds old: just past the tolerance window.
        let header = sign(payload, now.unix_timestamp() - 301);
        let result = verifier.verify(payload, &header, now);
        assert!(matches!(result, Err(IngestError::Verification(_))));
    }

    #[test]
    fn accepts_timestamp_at_tolerance_boundary() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, now.unix_timestamp() - 300);
        assert!(verifier.verify(payload, &header, now).is_ok());
    }

    #[test]
    fn rejects_future_timestamp_beyond_skew() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, now.unix_timestamp() + 400);
        assert!(verifier.verify(payload, &header, now).is_err());
    }

    #[test]
    fn rejects_malformed_header() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        for header in ["", "t=abc", "v1=deadbeef", "t=,v1="] {
            assert!(verifier.verify(b"{}", header, now).is_err(), "{header:?}");
        }
    }

    #[test]
    fn ignores_unknown_scheme_keys() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        let payload = br#"{"id":"evt_1"}"#;
        let header = format!("{},v0=ignored", sign(payload, now.unix_timestamp()));
        assert!(verifier.verify(payload, &header, now).is_ok());
    }
}
