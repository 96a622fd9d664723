//! Content-derived idempotency keys (spec.md §3 invariants, §4.13, §9).
//!
//! The key is deterministic and survives the envelope being re-ingested
//! under a different `event_id`: two deliveries of the same logical event
//! collapse onto the same key so the worker's `IdempotencyStore` can
//! suppress the duplicate regardless of which ingress instance assigned
//! which UUID to which delivery.

use crate::canonical::canonical_bytes;
use serde_json::Value;
use uuid::Uuid;

/// Fixed root namespace for this system. Every provider gets its own
/// derived namespace from this constant (see `provider_namespace`), which
/// is how "namespace=provider" (spec.md §3) and "a stable namespace-UUID
/// constant for this system" (spec.md §9) are both satisfied: the root
/// constant never changes, but it deterministically fans out into one
/// namespace per provider.
const ROOT_NAMESPACE: Uuid = Uuid::from_u128(0x5c52_0f2a_8f2e_4f3a_9d2e_1b6a3c7d8e90);

pub fn provider_namespace(provider_name: &str) -> Uuid {
    Uuid::new_v5(&ROOT_NAMESPACE, provider_name.as_bytes())
}

/// Extracts `payload["id"]` as a string if present and non-empty,
/// accepting string, integer and unsigned integer JSON representations.
fn payload_id(payload: &Value) -> Option<String> {
    let id = payload.get("id")?;
    if let Some(s) = id.as_str() {
        let trimmed = s.trim();
        return if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    if let Some(n) = id.as_i64() {
        return Some(n.to_string());
    }
    id.as_u64().map(|n| n.to_string())
}

/// Derives the content-based idempotency key for worker-side deduplication.
///
/// `UUIDv5(namespace=provider, name=payload["id"])` if the payload exposes
/// an `id`, else `UUIDv5(namespace=provider, name=canonical_payload_bytes)`.
/// Callers fall back to the envelope's own `event_id` only if this
/// function's precondition (a JSON payload) doesn't hold — see
/// `content_key_or_event_id`.
pub fn content_derived_key(provider_name: &str, payload: &Value) -> Uuid {
    let namespace = provider_namespace(provider_name);
    match payload_id(payload) {
        Some(id) => Uuid::new_v5(&namespace, id.as_bytes()),
        None => Uuid::new_v5(&namespace, &canonical_bytes(payload)),
    }
}

/// Convenience wrapper matching the fallback rule verbatim: if the payload
/// is absent (e.g. a compressed envelope the caller hasn't decompressed
/// yet) fall back to `event_id` rather than deriving from nothing.
pub fn content_key_or_event_id(provider_name: &str, payload: Option<&Value>, event_id: &str) -> Uuid {
    match payload {
        Some(payload) => content_derived_key(provider_name, payload),
        None => Uuid::new_v5(&provider_namespace(provider_name), event_id.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_id_different_envelope_collapses_to_same_key() {
        let payload = json!({"id": "evt_1", "type": "payment_intent.succeeded"});
        let a = content_derived_key("stripe", &payload);
        let b = content_derived_key("stripe", &payload);
        assert_eq!(a, b);
    }

    #[test]
    fn different_providers_never_collide_on_same_id() {
        let payload = json!({"id": "evt_1"});
        assert_ne!(
            content_derived_key("stripe", &payload),
            content_derived_key("github", &payload)
        );
    }

    #[test]
    fn falls_back_to_canonical_payload_hash_without_id() {
        let a = json!({"type": "ping", "zzz": 1, "aaa": 2});
        let b = json!({"zzz": 1, "type": "ping", "aaa": 2});
        assert_eq!(content_derived_key("github", &a), content_derived_key("github", &b));
    }

    #[test]
    fn numeric_id_and_string_id_are_equivalent() {
        let a = json!({"id": 42});
        let b = json!({"id": "42"});
        assert_eq!(content_derived_key("linear", &a), content_derived_key("linear", &b));
    }
}
