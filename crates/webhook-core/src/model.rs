//! Wire and in-memory data model shared by the ingress and worker roles.
//!
//! `WebhookEnvelope` is immutable once built: every field is assigned during
//! ingress and never rewritten downstream. `WebhookRejectedEvent` is a
//! superset used for the dead-letter destination (spec.md §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Case-insensitive, first-value-wins header map, serialized as an ordinary
/// JSON object. Provider headers are looked up by lowercased name.
pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAgentInfo {
    pub raw: String,
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device_type: String,
    pub is_bot: bool,
}

impl UserAgentInfo {
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            browser: "Unknown".to_string(),
            browser_version: "Unknown".to_string(),
            os: "Unknown".to_string(),
            os_version: "Unknown".to_string(),
            device_type: "Unknown".to_string(),
            is_bot: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    pub request_id: String,
    pub received_at_nanos: i64,
    pub request_size: usize,
    pub user_agent: UserAgentInfo,
}

/// The durable record of a received webhook, as placed on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event_id: String,
    pub provider_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_payload: Option<Vec<u8>>,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<CompressionAlgorithm>,
    pub headers: HeaderMap,
    pub query_params: HeaderMap,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub source_ip: String,
    pub http_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub enriched_metadata: EnrichedMetadata,
}

impl WebhookEnvelope {
    /// The bytes a content-derived idempotency key or a signature check
    /// should be computed over: the parsed tree if present, else whatever
    /// the compressed payload decompresses to (callers on the worker side
    /// are expected to have already decompressed before calling this).
    pub fn payload_or_default(&self) -> Value {
        self.payload.clone().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCategory {
    ValidationFailure,
    ProcessingFailure,
    TimeoutFailure,
    UnrecoverableError,
    RateLimitExceeded,
    Other,
}

/// DLQ record: superset of `WebhookEnvelope` plus rejection metadata
/// (spec.md §3, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRejectedEvent {
    #[serde(flatten)]
    pub envelope: WebhookEnvelope,
    pub rejected_at: chrono::DateTime<chrono::Utc>,
    pub rejection_reason: String,
    pub rejection_category: RejectionCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Accepted,
    Error,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMetadata {
    pub destination: String,
    pub source_ip: String,
    pub http_method: String,
    pub payload_size: usize,
    pub header_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// HTTP response DTO (spec.md §3 `WebhookAck`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub status: AckStatus,
    pub message: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub processed_at: chrono::DateTime<chrono::Utc>,
    pub provider_name: String,
    pub received_payload: Value,
    pub metadata: AckMetadata,
}

/// Lowercases and trims a raw path segment into the canonical provider-name
/// form used as a map key everywhere in the system. Validity against the
/// configured pattern is the validator's job (spec.md §4.1), not this
/// function's — this only normalizes casing so two requests for "Stripe"
/// and "stripe" hit the same rate-limit bucket and idempotency namespace.
pub fn normalize_provider_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
