//! Deterministic JSON canonicalization used to derive content-based
//! idempotency keys (spec.md §3 invariants, §9 Design Notes).
//!
//! Object keys are reordered lexicographically at every nesting level;
//! arrays keep their original order since array order is observable
//! payload content, not incidental serialization order.

use serde_json::{Map, Value};

pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}
