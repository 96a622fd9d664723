//! Best-effort dead-letter publish on the worker side (spec.md §4.8, C8).
//! Same shape as the ingress role's writer — a failed publish here must
//! never block message processing or panic the consumer loop. Guarded by
//! its own circuit breaker (spec.md §4.7, C7) so a broker outage doesn't
//! burn a send timeout on every failed message; its state feeds worker
//! readiness (spec.md §4.14, C14).

use std::sync::Arc;

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, warn};
use webhook_core::model::{RejectionCategory, WebhookEnvelope, WebhookRejectedEvent};
use webhook_core::resilience::{CircuitBreaker, CircuitBreakerConfig};

fn rejection_category_label(category: RejectionCategory) -> &'static str {
    match category {
        RejectionCategory::ValidationFailure => "VALIDATION_FAILURE",
        RejectionCategory::ProcessingFailure => "PROCESSING_FAILURE",
        RejectionCategory::TimeoutFailure => "TIMEOUT_FAILURE",
        RejectionCategory::UnrecoverableError => "UNRECOVERABLE_ERROR",
        RejectionCategory::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        RejectionCategory::Other => "OTHER",
    }
}

pub struct DlqWriter {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl DlqWriter {
    pub fn new(producer: FutureProducer, topic: String, send_timeout: Duration) -> Self {
        Self::with_breaker_config(producer, topic, send_timeout, CircuitBreakerConfig::default())
    }

    pub fn with_breaker_config(
        producer: FutureProducer,
        topic: String,
        send_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            producer,
            topic,
            send_timeout,
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub async fn write(
        &self,
        envelope: WebhookEnvelope,
        category: RejectionCategory,
        reason: impl Into<String>,
        error_details: Option<String>,
        retry_count: Option<u32>,
    ) {
        let reason = reason.into();
        let event_id = envelope.event_id.clone();
        let provider_name = envelope.provider_name.clone();
        let rejected_at = chrono::Utc::now();
        let event = WebhookRejectedEvent {
            envelope,
            rejected_at,
            rejection_reason: reason.clone(),
            rejection_category: category,
            error_details,
            retry_count,
            exception_type: None,
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(event_id = %event_id, %error, "failed to serialize dead-letter event");
                return;
            }
        };

        let Ok(permit) = self.breaker.acquire() else {
            warn!(event_id = %event_id, topic = %self.topic, "dlq circuit breaker open, dropping dead-letter event");
            return;
        };

        let rejected_at_rfc3339 = rejected_at.to_rfc3339();
        let mut headers = rdkafka::message::OwnedHeaders::new()
            .insert(rdkafka::message::Header {
                key: "provider",
                value: Some(provider_name.as_str()),
            })
            .insert(rdkafka::message::Header {
                key: "eventId",
                value: Some(event_id.as_str()),
            })
            .insert(rdkafka::message::Header {
                key: "rejectionCategory",
                value: Some(rejection_category_label(category)),
            })
            .insert(rdkafka::message::Header {
                key: "rejectedAt",
                value: Some(rejected_at_rfc3339.as_str()),
            });
        let retry_count_label = retry_count.map(|count| count.to_string());
        if let Some(label) = &retry_count_label {
            headers = headers.insert(rdkafka::message::Header {
                key: "retryCount",
                value: Some(label.as_str()),
            });
        }

        let record = FutureRecord::to(&self.topic).key(&event_id).payload(&payload).headers(headers);
        match self.producer.send(record, Timeout::After(self.send_timeout)).await {
            Ok(_) => self.breaker.record_success(permit),
            Err((error, _message)) => {
                self.breaker.record_failure(permit);
                warn!(
                    event_id = %event_id,
                    topic = %self.topic,
                    reason = %reason,
                    %error,
                    "failed to publish dead-letter event"
                );
            }
        }
    }
}
