//! Pluggable per-provider signature verification (spec.md §4.11, C11).
//!
//! Each provider gets one `SignatureValidator`. The Stripe-style reference
//! implementation is timestamp-tolerant HMAC-SHA256; GitHub and Linear are
//! adapted from the teacher's `sources::github`/`sources::linear` (same
//! HMAC-SHA256 primitive, different header conventions, no timestamp).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Case-insensitive header lookup abstraction so this crate never depends
/// on axum's `HeaderMap` type directly — the ingress binary adapts its own
/// headers, the worker adapts `model::HeaderMap` (see `impl` below).
pub trait HeaderLookup {
    fn get_header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for crate::model::HeaderMap {
    fn get_header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.iter()
            .find(|(key, _)| key.to_ascii_lowercase() == lower)
            .map(|(_, value)| value.as_str())
    }
}

pub trait SignatureValidator: Send + Sync {
    /// Whether this provider requires a signature at all. A provider with
    /// no configured secret returns `false` here and `validate` is skipped.
    fn is_validation_required(&self) -> bool;

    /// `now_epoch_seconds` is passed explicitly (rather than read from the
    /// wall clock inside this function) so replay-window tests are
    /// deterministic, matching the teacher's `timestamps::verify_linear_timestamp_window`.
    fn validate(
        &self,
        payload_bytes: &[u8],
        headers: &dyn HeaderLookup,
        secret: &str,
        now_epoch_seconds: i64,
    ) -> bool;
}

pub fn compute_hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts variable-length keys");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison that never returns based purely on a length
/// mismatch before performing the byte comparison (spec.md §4.11): the
/// `ct_eq` call always runs over a fixed-size buffer, and only its boolean
/// result is ANDed with whether the provided hex decoded to the expected
/// length, after the comparison has already executed.
fn constant_time_hex_eq(expected_bytes: &[u8], provided_hex: &str) -> bool {
    let decoded = hex::decode(provided_hex.trim());
    let mut provided = vec![0u8; expected_bytes.len()];
    let length_ok = match &decoded {
        Ok(bytes) => bytes.len() == expected_bytes.len(),
        Err(_) => false,
    };
    if let Ok(bytes) = &decoded {
        let copy_len = bytes.len().min(provided.len());
        provided[..copy_len].copy_from_slice(&bytes[..copy_len]);
    }
    let bytes_match: bool = expected_bytes.ct_eq(&provided).into();
    bytes_match & length_ok
}

/// Stripe-style signature: `t=<unix_seconds>,v1=<hex>` header, HMAC-SHA256
/// over `"{t}.{payload}"`, with replay-window tolerance (spec.md §4.11).
pub struct StripeSignatureValidator {
    pub header_name: String,
    pub tolerance_seconds: i64,
}

impl StripeSignatureValidator {
    pub fn new(header_name: impl Into<String>, tolerance_seconds: i64) -> Self {
        Self {
            header_name: header_name.into(),
            tolerance_seconds,
        }
    }

    fn parse_header(raw: &str) -> Option<(i64, &str)> {
        let mut timestamp = None;
        let mut v1 = None;
        for part in raw.split(',') {
            let mut kv = part.splitn(2, '=');
            let key = kv.next()?.trim();
            let value = kv.next()?.trim();
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => v1 = Some(value),
                _ => {}
            }
        }
        Some((timestamp?, v1?))
    }
}

impl SignatureValidator for StripeSignatureValidator {
    fn is_validation_required(&self) -> bool {
        true
    }

    fn validate(
        &self,
        payload_bytes: &[u8],
        headers: &dyn HeaderLookup,
        secret: &str,
        now_epoch_seconds: i64,
    ) -> bool {
        let Some(raw) = headers.get_header(&self.header_name) else {
            return false;
        };
        let Some((timestamp, v1)) = Self::parse_header(raw) else {
            return false;
        };
        if (now_epoch_seconds - timestamp).abs() > self.tolerance_seconds {
            return false;
        }

        let mut signed_payload = timestamp.to_string().into_bytes();
        signed_payload.push(b'.');
        signed_payload.extend_from_slice(payload_bytes);

        let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(&signed_payload);
        let expected = mac.finalize().into_bytes();
        constant_time_hex_eq(&expected, v1)
    }
}

/// GitHub-style: `sha256=<hex>` over the raw body, no timestamp.
pub struct GithubSignatureValidator {
    pub header_name: String,
}

impl GithubSignatureValidator {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }
}

impl SignatureValidator for GithubSignatureValidator {
    fn is_validation_required(&self) -> bool {
        true
    }

    fn validate(
        &self,
        payload_bytes: &[u8],
        headers: &dyn HeaderLookup,
        secret: &str,
        _now_epoch_seconds: i64,
    ) -> bool {
        let Some(raw) = headers.get_header(&self.header_name) else {
            return false;
        };
        let provided = raw.strip_prefix("sha256=").unwrap_or(raw);

        let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload_bytes);
        let expected = mac.finalize().into_bytes();
        constant_time_hex_eq(&expected, provided)
    }
}

/// Linear-style: bare hex HMAC-SHA256 over the raw body, no prefix, no
/// timestamp (Linear's own replay-window check lives separately against the
/// payload's `webhookTimestamp` field and is out of scope here).
pub struct LinearSignatureValidator {
    pub header_name: String,
}

impl LinearSignatureValidator {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }
}

impl SignatureValidator for LinearSignatureValidator {
    fn is_validation_required(&self) -> bool {
        true
    }

    fn validate(
        &self,
        payload_bytes: &[u8],
        headers: &dyn HeaderLookup,
        secret: &str,
        _now_epoch_seconds: i64,
    ) -> bool {
        let Some(raw) = headers.get_header(&self.header_name) else {
            return false;
        };
        let provided = raw.strip_prefix("sha256=").unwrap_or(raw);

        let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload_bytes);
        let expected = mac.finalize().into_bytes();
        constant_time_hex_eq(&expected, provided)
    }
}

/// Fallback for providers with no dedicated strategy (spec.md §9: "unknown
/// providers fall back to defaults"). Plain HMAC-SHA256 hex, no prefix, no
/// timestamp tolerance.
pub struct DefaultHmacValidator {
    pub header_name: String,
    pub required: bool,
}

impl SignatureValidator for DefaultHmacValidator {
    fn is_validation_required(&self) -> bool {
        self.required
    }

    fn validate(
        &self,
        payload_bytes: &[u8],
        headers: &dyn HeaderLookup,
        secret: &str,
        _now_epoch_seconds: i64,
    ) -> bool {
        let Some(raw) = headers.get_header(&self.header_name) else {
            return false;
        };
        let provided = raw.strip_prefix("sha256=").unwrap_or(raw);
        let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload_bytes);
        let expected = mac.finalize().into_bytes();
        constant_time_hex_eq(&expected, provided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn headers_with(name: &str, value: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), value.to_string());
        map
    }

    #[test]
    fn stripe_accepts_timestamp_exactly_at_tolerance_boundary() {
        let secret = "whsec_test";
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_900;
        let t = now - 900;
        let mut signed = t.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let digest = compute_hmac_sha256_hex(secret, &signed);

        let validator = StripeSignatureValidator::new("Stripe-Signature", 900);
        let headers = headers_with("Stripe-Signature", &format!("t={t},v1={digest}"));
        assert!(validator.validate(payload, &headers, secret, now));
    }

    #[test]
    fn stripe_rejects_timestamp_one_second_past_tolerance() {
        let secret = "whsec_test";
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_901;
        let t = now - 901;
        let mut signed = t.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let digest = compute_hmac_sha256_hex(secret, &signed);

        let validator = StripeSignatureValidator::new("Stripe-Signature", 900);
        let headers = headers_with("Stripe-Signature", &format!("t={t},v1={digest}"));
        assert!(!validator.validate(payload, &headers, secret, now));
    }

    #[test]
    fn stripe_rejects_wrong_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let mut signed = now.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let digest = compute_hmac_sha256_hex("right-secret", &signed);

        let validator = StripeSignatureValidator::new("Stripe-Signature", 900);
        let headers = headers_with("Stripe-Signature", &format!("t={now},v1={digest}"));
        assert!(!validator.validate(payload, &headers, "wrong-secret", now));
    }

    #[test]
    fn stripe_rejects_missing_parts() {
        let validator = StripeSignatureValidator::new("Stripe-Signature", 900);
        let headers = headers_with("Stripe-Signature", "v1=deadbeef");
        assert!(!validator.validate(b"{}", &headers, "secret", 1_700_000_000));
    }

    #[test]
    fn github_accepts_sha256_prefixed_signature() {
        let secret = "github-secret";
        let payload = br#"{"action":"opened"}"#;
        let digest = compute_hmac_sha256_hex(secret, payload);
        let validator = GithubSignatureValidator::new("X-Hub-Signature-256");
        let headers = headers_with("X-Hub-Signature-256", &format!("sha256={digest}"));
        assert!(validator.validate(payload, &headers, secret, 0));
        assert!(!validator.validate(payload, &headers, "other", 0));
    }

    #[test]
    fn linear_accepts_bare_hex_signature() {
        let secret = "linear-secret";
        let payload = br#"{"type":"Issue"}"#;
        let digest = compute_hmac_sha256_hex(secret, payload);
        let validator = LinearSignatureValidator::new("Linear-Signature");
        let headers = headers_with("Linear-Signature", &digest);
        assert!(validator.validate(payload, &headers, secret, 0));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length_without_panicking() {
        let expected = [0u8; 32];
        assert!(!constant_time_hex_eq(&expected, "deadbeef"));
        assert!(!constant_time_hex_eq(&expected, "not-hex-at-all"));
    }
}
