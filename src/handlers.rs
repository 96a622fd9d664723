//! IngressController (spec.md §4.9, C9): orchestrates C1–C8 and returns the
//! `WebhookAck` DTO. Lifecycle mirrors the teacher's `webhook_handler`
//! (`main.rs`), generalized from two hardcoded sources to the provider-path
//! pipeline: rate limit → validate → idempotency lookup → enrich → publish
//! (batched or direct) → ack.

use crate::batch::BatchItem;
use crate::client_ip::extract_client_ip;
use crate::config::Config;
use crate::metadata;
use crate::publisher::{self, Publisher};
use crate::rate_limit::RateLimitGate;
use crate::validator::{self, RejectReason, ValidationRequest};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use webhook_core::compression::Compressor;
use webhook_core::metrics::MetricsRegistry;
use webhook_core::model::{
    AckMetadata, AckStatus, EnrichedMetadata, HeaderMap, RejectionCategory, WebhookAck, WebhookEnvelope,
};
use webhook_core::resilience::ResilienceError;
use webhook_core::trace::TraceContext;

pub struct AppState {
    pub config: Config,
    pub provider_name_pattern: Regex,
    pub rate_limit_gate: RateLimitGate,
    pub compressor: Compressor,
    pub batcher: Option<crate::batch::Batcher>,
    pub publisher: Arc<Publisher>,
    pub dlq: Arc<crate::dlq::DlqWriter>,
    pub http_idempotency: webhook_core::idempotency::TtlCache<(u16, WebhookAck)>,
    pub metrics: MetricsRegistry,
    pub health_probes: Vec<Box<dyn webhook_core::health::ConnectivityProbe>>,
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(provider_raw): Path<String>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: AxumHeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let started_at = Instant::now();
    let received_at = chrono::Utc::now();
    let event_id = Uuid::new_v4().to_string();
    let provider_name = webhook_core::model::normalize_provider_name(&provider_raw);

    let header_snapshot = snapshot_headers(&headers);
    let trace = TraceContext::extract_or_new(&header_snapshot);
    let span = tracing::info_span!("webhook_request", event_id = %event_id, provider = %provider_name, trace_id = %trace.trace_id);
    let _guard = span.enter();

    state.metrics.inc_received(&provider_name);

    let client_ip = extract_client_ip(
        &headers,
        peer.ip(),
        state.config.trust_proxy_headers,
        &state.config.trusted_proxy_cidrs,
    );

    let provider_rate_limit = state.config.provider_rate_limit_for(&provider_name);
    if !state.rate_limit_gate.admit(&provider_name, provider_rate_limit, &client_ip.to_string()).await {
        state.metrics.inc_rejected(&provider_name, "rate_limit_exceeded");
        warn!(provider = %provider_name, ip = %client_ip, "rate limit denied");
        return reject_response(
            &event_id,
            &provider_name,
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
            received_at,
            client_ip.to_string(),
            &body,
        );
    }

    let allowlist = state.config.ip_allowlist_for(&provider_name);
    let content_type = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let validation = ValidationRequest {
        provider_name: &provider_name,
        payload_len: body.len(),
        content_type,
        source_ip: client_ip,
    };
    if let Err(reason) = validator::validate(
        &validation,
        &state.provider_name_pattern,
        state.config.max_payload_bytes,
        &state.config.allowed_content_types,
        state.config.require_content_type,
        allowlist,
    ) {
        state.metrics.inc_rejected(&provider_name, reason.as_metric_tag());
        return reject_response(
            &event_id,
            &provider_name,
            status_for_reject(reason),
            reject_message(reason),
            received_at,
            client_ip.to_string(),
            &body,
        );
    }

    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| format!("idempotency:{v}"));
    if let Some(key) = &idempotency_key {
        if let Some((status, cached)) = state.http_idempotency.get(key) {
            state.metrics.inc_duplicate(&provider_name);
            return (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(cached)).into_response();
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            state.metrics.inc_rejected(&provider_name, "bad_request");
            return reject_response(
                &event_id,
                &provider_name,
                StatusCode::BAD_REQUEST,
                "request body is not valid json",
                received_at,
                client_ip.to_string(),
                &body,
            );
        }
    };

    let query_params: HeaderMap = parse_query_string(raw_query.as_deref().unwrap_or_default());
    let correlation_id = headers.get("x-correlation-id").and_then(|v| v.to_str().ok()).map(str::to_string);

    let enriched_metadata: EnrichedMetadata = metadata::enrich(
        headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()),
        received_at.timestamp_nanos_opt().unwrap_or_default(),
        body.len(),
    );

    let mut envelope = WebhookEnvelope {
        event_id: event_id.clone(),
        provider_name: provider_name.clone(),
        payload: Some(payload.clone()),
        compressed_payload: None,
        compressed: false,
        algorithm: None,
        headers: header_snapshot.clone(),
        query_params,
        received_at,
        source_ip: client_ip.to_string(),
        http_method: "POST".to_string(),
        correlation_id: correlation_id.clone(),
        enriched_metadata,
    };

    if state.config.compression_enabled {
        if let Ok(Some((compressed, algorithm, _ratio))) = state.compressor.compress_if_needed(&body) {
            envelope.payload = None;
            envelope.compressed_payload = Some(compressed);
            envelope.compressed = true;
            envelope.algorithm = Some(algorithm);
        }
    }

    let destination = publisher::resolve_destination(
        &provider_name,
        state.config.custom_destination_for(&provider_name),
        &state.config.kafka_topic_prefix,
        &state.config.kafka_topic_suffix,
    );

    let publish_result = dispatch(&state, &envelope, &destination, &trace).await;

    if let Err(error) = publish_result {
        let (status, category, message) = map_publish_error(&error);
        state.metrics.inc_failed(&provider_name, category_tag(category));
        state.dlq.write(envelope.clone(), category, message.to_string(), Some(error.to_string())).await;
        return reject_response(
            &event_id,
            &provider_name,
            status,
            message,
            received_at,
            client_ip.to_string(),
            &body,
        );
    }

    let processed_at = chrono::Utc::now();
    let ack = WebhookAck {
        event_id: event_id.clone(),
        status: AckStatus::Accepted,
        message: "accepted".to_string(),
        received_at,
        processed_at,
        provider_name: provider_name.clone(),
        received_payload: payload,
        metadata: AckMetadata {
            destination,
            source_ip: client_ip.to_string(),
            http_method: "POST".to_string(),
            payload_size: body.len(),
            header_count: header_snapshot.len(),
            response_time_ms: Some(started_at.elapsed().as_millis() as u64),
            correlation_id,
        },
    };

    if let Some(key) = &idempotency_key {
        state
            .http_idempotency
            .insert(key, (StatusCode::ACCEPTED.as_u16(), ack.clone()), state.config.http_idempotency_ttl);
    }

    state.metrics.inc_published(&provider_name);
    state
        .metrics
        .observe_processing_time(&provider_name, started_at.elapsed().as_secs_f64());
    info!(event_id = %ack.event_id, provider = %provider_name, "webhook accepted");

    (StatusCode::ACCEPTED, Json(ack)).into_response()
}

async fn dispatch(
    state: &AppState,
    envelope: &WebhookEnvelope,
    destination: &str,
    trace: &TraceContext,
) -> Result<(), ResilienceError<publisher::PublishError>> {
    if let Some(batcher) = &state.batcher {
        let item = BatchItem {
            envelope: envelope.clone(),
        };
        if batcher.submit(destination, item) {
            return Ok(());
        }
        warn!(destination, "batch buffer full, falling back to direct publish");
    }
    state.publisher.publish(envelope, destination, trace).await
}

fn map_publish_error(
    error: &ResilienceError<publisher::PublishError>,
) -> (StatusCode, RejectionCategory, &'static str) {
    match error {
        ResilienceError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, RejectionCategory::TimeoutFailure, "publish timed out"),
        ResilienceError::CircuitOpen => (StatusCode::SERVICE_UNAVAILABLE, RejectionCategory::TimeoutFailure, "downstream circuit open"),
        ResilienceError::Operation(_) => (StatusCode::BAD_GATEWAY, RejectionCategory::ProcessingFailure, "publish failed"),
    }
}

fn category_tag(category: RejectionCategory) -> &'static str {
    match category {
        RejectionCategory::ValidationFailure => "validation_failure",
        RejectionCategory::ProcessingFailure => "processing_failure",
        RejectionCategory::TimeoutFailure => "timeout_failure",
        RejectionCategory::UnrecoverableError => "unrecoverable_error",
        RejectionCategory::RateLimitExceeded => "rate_limit_exceeded",
        RejectionCategory::Other => "other",
    }
}

fn status_for_reject(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::BadRequest => StatusCode::BAD_REQUEST,
        RejectReason::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        RejectReason::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        RejectReason::Forbidden => StatusCode::FORBIDDEN,
    }
}

fn reject_message(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::BadRequest => "bad request",
        RejectReason::PayloadTooLarge => "payload too large",
        RejectReason::UnsupportedMediaType => "unsupported media type",
        RejectReason::Forbidden => "source ip is not allowed",
    }
}

fn reject_response(
    event_id: &str,
    provider_name: &str,
    status: StatusCode,
    message: &str,
    received_at: chrono::DateTime<chrono::Utc>,
    source_ip: String,
    body: &[u8],
) -> Response {
    let received_payload = serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
    let ack_status = if status.is_client_error() {
        AckStatus::Rejected
    } else {
        AckStatus::Error
    };
    let ack = WebhookAck {
        event_id: event_id.to_string(),
        status: ack_status,
        message: message.to_string(),
        received_at,
        processed_at: chrono::Utc::now(),
        provider_name: provider_name.to_string(),
        received_payload,
        metadata: AckMetadata {
            destination: String::new(),
            source_ip,
            http_method: "POST".to_string(),
            payload_size: body.len(),
            header_count: 0,
            response_time_ms: None,
            correlation_id: None,
        },
    };
    (status, Json(ack)).into_response()
}

fn parse_query_string(raw: &str) -> HeaderMap {
    let mut map = std::collections::BTreeMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn snapshot_headers(headers: &AxumHeaderMap) -> HeaderMap {
    let mut map = std::collections::BTreeMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

pub async fn liveness_handler() -> impl IntoResponse {
    let result = webhook_core::health::liveness();
    (StatusCode::OK, Json(result))
}

pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breaker_state = state.publisher.breaker_state();
    let results =
        webhook_core::health::readiness(&[("publisher", breaker_state)], &state.health_probes).await;
    let status = if webhook_core::health::all_up(&results) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(results))
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}
