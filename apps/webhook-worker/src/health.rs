//! Worker-side liveness/readiness/metrics HTTP surface (spec.md §4.14, C14).
//! Same routes and handler shape as the ingress role's `handlers.rs`, with
//! no rate-limit/compression state to carry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use webhook_core::health::ConnectivityProbe;
use webhook_core::metrics::MetricsRegistry;
use webhook_core::resilience::CircuitBreaker;

pub struct HealthState {
    pub metrics: Arc<MetricsRegistry>,
    pub consumer_breaker: Option<Arc<CircuitBreaker>>,
    pub probes: Vec<Box<dyn ConnectivityProbe>>,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz/live", get(liveness_handler))
        .route("/healthz/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn liveness_handler() -> impl IntoResponse {
    let result = webhook_core::health::liveness();
    (StatusCode::OK, Json(result))
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let breaker_states: Vec<(&str, webhook_core::resilience::CircuitState)> = state
        .consumer_breaker
        .as_ref()
        .map(|breaker| vec![("dlq", breaker.state())])
        .unwrap_or_default();
    let results = webhook_core::health::readiness(&breaker_states, &state.probes).await;
    let status = if webhook_core::health::all_up(&results) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(results))
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}
