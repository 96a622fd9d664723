mod config;
mod consumer;
mod dlq;
mod health;
mod health_probes;
mod processor;
mod processor_host;
mod providers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use config::WorkerConfig;
use consumer::ConsumerRuntime;
use dlq::DlqWriter;
use health::HealthState;
use health_probes::{IdempotencyStoreProbe, KafkaConnectivityProbe};
use processor::{LoggingProcessor, ProcessorRegistry};
use processor_host::WebhookProcessorHost;
use providers::ProviderRegistry;
use rdkafka::ClientConfig;
use rdkafka::producer::FutureProducer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webhook_core::idempotency::InMemoryIdempotencyStore;
use webhook_core::metrics::MetricsRegistry;
use webhook_core::resilience::CircuitBreakerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = WorkerConfig::from_env().context("load webhook worker config")?;

    let metrics = Arc::new(MetricsRegistry::new().context("construct metrics registry")?);

    let dlq_producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .context("initialize kafka dlq producer")?;
    let kafka_probe: Box<dyn webhook_core::health::ConnectivityProbe> =
        Box::new(KafkaConnectivityProbe::new(dlq_producer.clone(), config.dlq_publish_timeout));
    let dlq = Arc::new(DlqWriter::with_breaker_config(
        dlq_producer,
        config.kafka_dlq_topic.clone(),
        config.dlq_publish_timeout,
        CircuitBreakerConfig {
            minimum_calls: config.circuit_breaker_min_calls,
            sliding_window_size: config.circuit_breaker_window_size,
            failure_rate_threshold: config.circuit_breaker_failure_rate,
            slow_call_duration_threshold: config.circuit_breaker_slow_call_duration,
            slow_call_rate_threshold: config.circuit_breaker_slow_call_rate,
            open_state_duration: config.circuit_breaker_open_duration,
            half_open_required_successes: config.circuit_breaker_half_open_successes,
        },
    ));

    // Adopting teams register their own `WebhookProcessor`s here; the
    // catch-all only proves the host wiring (spec.md §4.13).
    let processors = Arc::new(ProcessorRegistry::new(Box::new(LoggingProcessor::new("*"))));

    let lock_duration = config.idempotency_lock_duration;
    let processed_ttl = config.idempotency_processed_ttl;
    let max_delivery_attempts = config.retry_max_attempts;
    let providers = Arc::new(ProviderRegistry::new(config.clone()));

    let idempotency_store = Arc::new(InMemoryIdempotencyStore::new());
    let kv_probe: Box<dyn webhook_core::health::ConnectivityProbe> =
        Box::new(IdempotencyStoreProbe::new(idempotency_store.clone(), lock_duration));

    let dlq_breaker = dlq.breaker();
    let host = Arc::new(WebhookProcessorHost::new(
        idempotency_store,
        providers,
        processors,
        dlq,
        metrics.clone(),
        lock_duration,
        processed_ttl,
        max_delivery_attempts,
    ));

    let consumer = ConsumerRuntime::from_config(&config, host).context("initialize kafka consumer")?;

    let health_state = Arc::new(HealthState {
        metrics,
        consumer_breaker: Some(dlq_breaker),
        probes: vec![kafka_probe, kv_probe],
    });
    let health_app: Router = health::router(health_state);
    let health_listener = TcpListener::bind(&config.health_bind_addr)
        .await
        .with_context(|| format!("bind {}", config.health_bind_addr))?;

    info!(bind = %config.health_bind_addr, "webhook worker health surface listening");

    tokio::select! {
        result = consumer.run() => result.context("kafka consumer loop exited"),
        result = axum::serve(health_listener, health_app).with_graceful_shutdown(shutdown_signal()) => {
            result.context("serve webhook worker health surface")
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
