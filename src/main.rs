mod batch;
mod client_ip;
mod config;
mod dlq;
mod handlers;
mod health_probes;
mod metadata;
mod publisher;
mod rate_limit;
mod validator;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use handlers::AppState;
use rate_limit::RateLimitGate;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webhook_core::compression::Compressor;
use webhook_core::idempotency::TtlCache;
use webhook_core::metrics::MetricsRegistry;
use webhook_core::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ResilienceExecutor, RetryConfig, TimeLimiterConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load webhook ingress config")?;
    let provider_name_pattern =
        Regex::new(&config.provider_name_pattern).context("compile provider_name_pattern")?;

    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        minimum_calls: config.circuit_breaker_min_calls,
        sliding_window_size: config.circuit_breaker_window_size,
        failure_rate_threshold: config.circuit_breaker_failure_rate,
        slow_call_duration_threshold: config.circuit_breaker_slow_call_duration,
        slow_call_rate_threshold: config.circuit_breaker_slow_call_rate,
        open_state_duration: config.circuit_breaker_open_duration,
        half_open_required_successes: config.circuit_breaker_half_open_successes,
    });
    let retry = RetryConfig {
        max_attempts: config.retry_max_attempts,
        base_delay: config.retry_base_delay,
        max_delay: config.retry_max_delay,
        jitter_fraction: config.retry_jitter_fraction,
    };
    let time_limiter = TimeLimiterConfig {
        per_attempt_timeout: config.publish_timeout,
    };
    let resilience = ResilienceExecutor::new(breaker, retry, time_limiter);

    let publisher = Arc::new(
        publisher::Publisher::new(&config.kafka_brokers, resilience, config.publish_timeout)
            .context("initialize kafka publisher")?,
    );

    let dlq_producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .context("initialize kafka dlq producer")?;
    let kafka_probe: Box<dyn webhook_core::health::ConnectivityProbe> = Box::new(
        health_probes::KafkaConnectivityProbe::new(dlq_producer.clone(), config.publish_timeout),
    );
    let dlq = Arc::new(dlq::DlqWriter::new(
        dlq_producer,
        config.kafka_dlq_topic.clone(),
        config.publish_timeout,
    ));

    let batcher = if config.batching_enabled {
        let flush_publisher = publisher.clone();
        let flush: batch::FlushFn = Arc::new(move |destination, items| {
            let publisher = flush_publisher.clone();
            Box::pin(async move {
                for item in items {
                    let trace = webhook_core::trace::TraceContext::extract_or_new(&item.envelope.headers);
                    if let Err(error) = publisher.publish(&item.envelope, &destination, &trace).await {
                        tracing::warn!(
                            destination = %destination,
                            event_id = %item.envelope.event_id,
                            %error,
                            "batched publish failed"
                        );
                    }
                }
            })
        });
        Some(batch::Batcher::new(
            config.batch_max_size,
            config.batch_max_wait,
            config.batch_buffer_size,
            flush,
        ))
    } else {
        None
    };

    let state = Arc::new(AppState {
        rate_limit_gate: RateLimitGate::new(
            config.provider_rate_limit_per_minute,
            config.provider_rate_limit_burst,
            config.provider_rate_limit_refresh_period,
            config.ip_rate_limit_per_minute,
            config.ip_rate_limit_burst,
            config.ip_rate_limit_refresh_period,
            config.rate_limit_timeout,
        ),
        compressor: Compressor::new(config.compression_min_size),
        batcher,
        publisher,
        dlq,
        http_idempotency: TtlCache::new(),
        metrics: MetricsRegistry::new().context("construct metrics registry")?,
        provider_name_pattern,
        health_probes: vec![kafka_probe],
        config,
    });

    let app = Router::new()
        .route("/api/v1/webhook/{provider}", post(handlers::webhook_handler))
        .route("/healthz/live", get(handlers::liveness_handler))
        .route("/healthz/ready", get(handlers::readiness_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(DefaultBodyLimit::max(state.config.max_payload_bytes))
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("bind {}", state.config.bind_addr))?;

    info!(bind = %state.config.bind_addr, "webhook ingress listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve webhook ingress")?;

    if let Some(batcher) = Arc::into_inner(state).and_then(|state| state.batcher) {
        batcher.shutdown(std::time::Duration::from_secs(10)).await;
    }

    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
