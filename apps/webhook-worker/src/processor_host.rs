//! The `WebhookProcessorHost` state machine (spec.md §4.13, C13).
//!
//! Owns the full decision table between "a `WebhookEnvelope` came off the
//! broker" and "ack or nack this message": idempotency acquisition,
//! signature verification, dispatch to the registered `WebhookProcessor`,
//! and the mark-processed-before-release-before-ack ordering spec.md §9
//! calls out as load-bearing (a crash between mark and release must never
//! let a second worker redo the work; a crash between release and ack must
//! only ever cause a harmless redelivery, never a double-process).

use std::sync::Arc;
use std::time::{Duration, Instant};

use webhook_core::idempotency::IdempotencyStore;
use webhook_core::keys::content_key_or_event_id;
use webhook_core::metrics::MetricsRegistry;
use webhook_core::model::{RejectionCategory, WebhookEnvelope};

use crate::dlq::DlqWriter;
use crate::processor::{ProcessingOutcome, ProcessorRegistry};
use crate::providers::ProviderRegistry;

/// What the consumer runtime should do with the Kafka message offset.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOutcome {
    Ack,
    /// Don't commit the offset. `retry_after` is advisory — the consumer
    /// runtime has no broker-native delayed-redelivery primitive, so a
    /// requested retry delay is honored by sleeping before the next poll
    /// rather than by rescheduling the message itself (spec.md §9: "no
    /// native delay queue is assumed").
    Nack { retry_after: Option<Duration> },
}

pub struct WebhookProcessorHost {
    idempotency: Arc<dyn IdempotencyStore>,
    providers: Arc<ProviderRegistry>,
    processors: Arc<ProcessorRegistry>,
    dlq: Arc<DlqWriter>,
    metrics: Arc<MetricsRegistry>,
    lock_duration: Duration,
    processed_ttl: Duration,
    max_delivery_attempts: u32,
}

impl WebhookProcessorHost {
    pub fn new(
        idempotency: Arc<dyn IdempotencyStore>,
        providers: Arc<ProviderRegistry>,
        processors: Arc<ProcessorRegistry>,
        dlq: Arc<DlqWriter>,
        metrics: Arc<MetricsRegistry>,
        lock_duration: Duration,
        processed_ttl: Duration,
        max_delivery_attempts: u32,
    ) -> Self {
        Self {
            idempotency,
            providers,
            processors,
            dlq,
            metrics,
            lock_duration,
            processed_ttl,
            max_delivery_attempts,
        }
    }

    pub async fn handle(&self, envelope: WebhookEnvelope) -> HostOutcome {
        let provider = envelope.provider_name.clone();

        let processor = self.processors.resolve(&provider);
        if processor.provider_name() != provider && processor.provider_name() != "*" {
            tracing::debug!(event_id = %envelope.event_id, %provider, "no processor registered, skipping");
            return HostOutcome::Ack;
        }

        let key = content_key_or_event_id(&provider, envelope.payload.as_ref(), &envelope.event_id).to_string();

        match self.idempotency.try_acquire(&key, self.lock_duration).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(event_id = %envelope.event_id, %key, "already locked by another worker, skipping");
                return HostOutcome::Ack;
            }
            Err(error) => {
                tracing::warn!(event_id = %envelope.event_id, %error, "idempotency store unavailable, nacking for redelivery");
                return HostOutcome::Nack { retry_after: None };
            }
        }

        match self.idempotency.is_processed(&key).await {
            Ok(true) => {
                self.release(&key).await;
                self.metrics.inc_duplicate(&provider);
                return HostOutcome::Ack;
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(event_id = %envelope.event_id, %error, "idempotency lookup failed, nacking for redelivery");
                self.release(&key).await;
                return HostOutcome::Nack { retry_after: None };
            }
        }

        let (validator, secret) = self.providers.resolve(&provider);
        if validator.is_validation_required() {
            let Some(secret) = secret else {
                self.release(&key).await;
                self.dlq_invalid_signature(envelope, "signature required but no secret configured").await;
                return HostOutcome::Nack { retry_after: None };
            };
            let payload_bytes = webhook_core::canonical::canonical_bytes(&envelope.payload_or_default());
            let now = chrono::Utc::now().timestamp();
            if !validator.validate(&payload_bytes, &envelope.headers, secret, now) {
                self.release(&key).await;
                self.metrics.inc_rejected(&provider, "invalid_signature");
                self.dlq_invalid_signature(envelope, "signature verification failed").await;
                return HostOutcome::Nack { retry_after: None };
            }
        }

        processor.before_process(&envelope).await;
        let started = Instant::now();
        let outcome = processor.process(&envelope).await;
        self.metrics.observe_processing_time(&provider, started.elapsed().as_secs_f64());

        match outcome {
            Ok(ProcessingOutcome::Success) => {
                if let Err(error) = self.idempotency.mark_processed(&key, self.processed_ttl).await {
                    tracing::error!(event_id = %envelope.event_id, %error, "failed to mark processed");
                }
                processor.after_process(&envelope, &ProcessingOutcome::Success).await;
                self.release(&key).await;
                HostOutcome::Ack
            }
            Ok(outcome @ ProcessingOutcome::Skipped { .. }) => {
                processor.after_process(&envelope, &outcome).await;
                self.release(&key).await;
                HostOutcome::Ack
            }
            Ok(ProcessingOutcome::Retry { delay_seconds }) => {
                let _ = self.idempotency.record_failure(&key, "processor requested retry").await;
                self.release(&key).await;
                HostOutcome::Nack {
                    retry_after: Some(Duration::from_secs(delay_seconds)),
                }
            }
            Ok(ProcessingOutcome::Failed { reason }) => {
                self.fail(&key, &provider, envelope, &reason).await;
                HostOutcome::Nack { retry_after: None }
            }
            Err(error) => {
                let reason = error.to_string();
                self.fail(&key, &provider, envelope, &reason).await;
                HostOutcome::Nack { retry_after: None }
            }
        }
    }

    async fn fail(&self, key: &str, provider: &str, envelope: WebhookEnvelope, reason: &str) {
        let _ = self.idempotency.record_failure(key, reason).await;
        let attempts = self.idempotency.failure_count(key).await.unwrap_or(0);
        self.release(key).await;
        self.metrics.inc_failed(provider, "processing_failure");

        if attempts >= self.max_delivery_attempts {
            self.dlq
                .write(
                    envelope,
                    RejectionCategory::ProcessingFailure,
                    reason.to_string(),
                    None,
                    Some(attempts),
                )
                .await;
            self.metrics.inc_dlq_published("processing_failure");
        }
    }

    async fn dlq_invalid_signature(&self, envelope: WebhookEnvelope, reason: &str) {
        self.dlq
            .write(envelope, RejectionCategory::ValidationFailure, reason.to_string(), None, None)
            .await;
        self.metrics.inc_dlq_published("validation_failure");
    }

    async fn release(&self, key: &str) {
        if let Err(error) = self.idempotency.release(key).await {
            tracing::warn!(%key, %error, "failed to release idempotency lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderSecret, WorkerConfig};
    use crate::processor::{LoggingProcessor, WebhookProcessor};
    use async_trait::async_trait;
    use rdkafka::ClientConfig;
    use std::collections::HashMap;
    use webhook_core::idempotency::InMemoryIdempotencyStore;
    use webhook_core::model::{CompressionAlgorithm, EnrichedMetadata, UserAgentInfo};
    use webhook_core::signatures::compute_hmac_sha256_hex;

    fn envelope_for(provider: &str, payload: serde_json::Value, headers: HashMap<String, String>) -> WebhookEnvelope {
        WebhookEnvelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            provider_name: provider.to_string(),
            payload: Some(payload),
            compressed_payload: None,
            compressed: false,
            algorithm: None::<CompressionAlgorithm>,
            headers: headers.into_iter().collect(),
            query_params: Default::default(),
            received_at: chrono::Utc::now(),
            source_ip: "127.0.0.1".to_string(),
            http_method: "POST".to_string(),
            correlation_id: None,
            enriched_metadata: EnrichedMetadata {
                request_id: "req-1".to_string(),
                received_at_nanos: 0,
                request_size: 0,
                user_agent: UserAgentInfo::unknown(""),
            },
        }
    }

    fn worker_config(secrets: HashMap<String, ProviderSecret>) -> WorkerConfig {
        WorkerConfig {
            kafka_brokers: "localhost:9092".to_string(),
            kafka_group_id: "test".to_string(),
            kafka_topics: vec!["webhooks.test".to_string()],
            kafka_dlq_topic: "webhooks.dlq".to_string(),
            max_concurrent_messages: 8,
            idempotency_lock_duration: Duration::from_secs(300),
            idempotency_processed_ttl: Duration::from_secs(604_800),
            dlq_publish_timeout: Duration::from_secs(5),
            circuit_breaker_min_calls: 10,
            circuit_breaker_window_size: 20,
            circuit_breaker_failure_rate: 0.5,
            circuit_breaker_open_duration: Duration::from_secs(30),
            circuit_breaker_half_open_successes: 5,
            circuit_breaker_slow_call_duration: Duration::from_secs(5),
            circuit_breaker_slow_call_rate: 0.5,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
            retry_jitter_fraction: 0.2,
            default_signature_tolerance_seconds: 300,
            provider_secrets: secrets,
            health_bind_addr: "0.0.0.0:8081".to_string(),
        }
    }

    fn noop_dlq() -> Arc<DlqWriter> {
        let producer: rdkafka::producer::FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("construct a producer handle without connecting");
        Arc::new(DlqWriter::new(producer, "webhooks.dlq".to_string(), Duration::from_secs(1)))
    }

    struct AlwaysFailsProcessor;

    #[async_trait]
    impl WebhookProcessor for AlwaysFailsProcessor {
        fn provider_name(&self) -> &str {
            "acme"
        }

        async fn process(&self, _envelope: &WebhookEnvelope) -> anyhow::Result<ProcessingOutcome> {
            Ok(ProcessingOutcome::Failed {
                reason: "synthetic failure".to_string(),
            })
        }
    }

    fn host_with(
        secrets: HashMap<String, ProviderSecret>,
        processor: Box<dyn WebhookProcessor>,
        max_attempts: u32,
    ) -> WebhookProcessorHost {
        let mut processors = ProcessorRegistry::new(Box::new(LoggingProcessor::new("*")));
        processors.register(processor);

        WebhookProcessorHost::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(ProviderRegistry::new(worker_config(secrets))),
            Arc::new(processors),
            noop_dlq(),
            Arc::new(MetricsRegistry::new().expect("metrics registry")),
            Duration::from_secs(300),
            Duration::from_secs(604_800),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn acks_and_skips_a_duplicate_delivery() {
        let host = host_with(HashMap::new(), Box::new(LoggingProcessor::new("acme")), 3);
        let payload = serde_json::json!({"id": "evt-1"});
        let first = host.handle(envelope_for("acme", payload.clone(), HashMap::new())).await;
        assert_eq!(first, HostOutcome::Ack);

        let second = host.handle(envelope_for("acme", payload, HashMap::new())).await;
        assert_eq!(second, HostOutcome::Ack);
    }

    #[tokio::test]
    async fn nacks_without_dlq_below_max_attempts() {
        let host = host_with(HashMap::new(), Box::new(AlwaysFailsProcessor), 5);
        let outcome = host
            .handle(envelope_for("acme", serde_json::json!({"id": "evt-2"}), HashMap::new()))
            .await;
        assert_eq!(outcome, HostOutcome::Nack { retry_after: None });
    }

    #[tokio::test]
    async fn rejects_invalid_signature_without_invoking_the_processor() {
        let mut secrets = HashMap::new();
        secrets.insert(
            "acme".to_string(),
            ProviderSecret {
                secret: "acme-secret".to_string(),
                tolerance_seconds: None,
            },
        );
        let host = host_with(secrets, Box::new(AlwaysFailsProcessor), 5);

        let mut headers = HashMap::new();
        headers.insert("x-webhook-signature".to_string(), "deadbeef".to_string());
        let outcome = host
            .handle(envelope_for("acme", serde_json::json!({"id": "evt-3"}), headers))
            .await;
        assert_eq!(outcome, HostOutcome::Nack { retry_after: None });
    }

    #[tokio::test]
    async fn accepts_a_correctly_signed_message() {
        let mut secrets = HashMap::new();
        secrets.insert(
            "acme".to_string(),
            ProviderSecret {
                secret: "acme-secret".to_string(),
                tolerance_seconds: None,
            },
        );
        let host = host_with(secrets, Box::new(LoggingProcessor::new("acme")), 5);

        let payload = serde_json::json!({"id": "evt-4"});
        let canonical = webhook_core::canonical::canonical_bytes(&payload);
        let digest = compute_hmac_sha256_hex("acme-secret", &canonical);
        let mut headers = HashMap::new();
        headers.insert("x-webhook-signature".to_string(), digest);

        let outcome = host.handle(envelope_for("acme", payload, headers)).await;
        assert_eq!(outcome, HostOutcome::Ack);
    }
}
