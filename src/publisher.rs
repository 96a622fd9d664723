//! Broker publish (spec.md §4.6, C6) wrapped in the resilience envelope
//! (§4.7, C7). Adapted from the teacher's `KafkaPublisher`
//! (`producer.rs`), generalized from two hardcoded source topics to the
//! §6.2 destination-resolution rule and switched from the teacher's
//! hand-rolled retry loop to `webhook_core::resilience::ResilienceExecutor`.

use rdkafka::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use webhook_core::model::WebhookEnvelope;
use webhook_core::resilience::{CircuitState, ResilienceError, ResilienceExecutor};
use webhook_core::trace::TraceContext;

/// Resolves the destination topic for a provider (spec.md §6.2):
/// `custom_destination` takes priority when set, else `{prefix}{provider}{suffix}`.
pub fn resolve_destination(
    provider_name: &str,
    custom_destination: Option<&str>,
    topic_prefix: &str,
    topic_suffix: &str,
) -> String {
    match custom_destination {
        Some(custom) if !custom.is_empty() => custom.to_string(),
        _ => format!("{topic_prefix}{provider_name}{topic_suffix}"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("serialize webhook envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("kafka publish failed: {1} ({0:?})")]
    Kafka(Option<RDKafkaErrorCode>, String),
}

/// Permanent broker-side rejections spec.md §7 forbids retrying — retrying
/// these would only burn the retry budget and the circuit breaker's failure
/// window on an error a retry can never fix.
fn is_permanent_kafka_error(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::RecordListTooLarge
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::TopicException
    )
}

fn is_retryable(error: &PublishError) -> bool {
    match error {
        PublishError::Serialize(_) => false,
        // Unknown/unclassified broker errors (timeouts, connection resets,
        // queue-full) default to retryable; only named permanent rejections
        // are excluded.
        PublishError::Kafka(code, _) => !code.is_some_and(is_permanent_kafka_error),
    }
}

pub struct Publisher {
    producer: FutureProducer,
    resilience: ResilienceExecutor,
    send_timeout: Duration,
}

impl Publisher {
    pub fn new(brokers: &str, resilience: ResilienceExecutor, send_timeout: Duration) -> anyhow::Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.ms", "5")
            .create::<FutureProducer>()?;
        Ok(Self {
            producer,
            resilience,
            send_timeout,
        })
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.resilience.breaker.state()
    }

    /// Publishes `envelope` to `destination`. Message headers are exactly
    /// the closed set spec.md §6.2 names — `provider`, `eventId`,
    /// `receivedAt`, `correlationId?` plus the B3/request-id trace headers —
    /// never the raw inbound HTTP header snapshot.
    pub async fn publish(
        &self,
        envelope: &WebhookEnvelope,
        destination: &str,
        trace: &TraceContext,
    ) -> Result<(), ResilienceError<PublishError>> {
        let payload = serde_json::to_vec(envelope).map_err(PublishError::from).map_err(ResilienceError::Operation)?;
        let key = envelope.event_id.clone();
        let received_at = envelope.received_at.to_rfc3339();

        let mut kafka_headers = rdkafka::message::OwnedHeaders::new();
        for (name, value) in trace.outbound_headers() {
            kafka_headers = kafka_headers.insert(rdkafka::message::Header {
                key: name,
                value: Some(value.as_str()),
            });
        }
        kafka_headers = kafka_headers
            .insert(rdkafka::message::Header {
                key: "provider",
                value: Some(envelope.provider_name.as_str()),
            })
            .insert(rdkafka::message::Header {
                key: "eventId",
                value: Some(envelope.event_id.as_str()),
            })
            .insert(rdkafka::message::Header {
                key: "receivedAt",
                value: Some(received_at.as_str()),
            });
        if let Some(correlation_id) = &envelope.correlation_id {
            kafka_headers = kafka_headers.insert(rdkafka::message::Header {
                key: "correlationId",
                value: Some(correlation_id.as_str()),
            });
        }

        self.resilience
            .execute(is_retryable, || {
                let producer = self.producer.clone();
                let destination = destination.to_string();
                let payload = payload.clone();
                let key = key.clone();
                let kafka_headers = kafka_headers.clone();
                let send_timeout = self.send_timeout;
                async move {
                    let record = FutureRecord::to(&destination)
                        .key(&key)
                        .payload(&payload)
                        .headers(kafka_headers);
                    producer
                        .send(record, Timeout::After(send_timeout))
                        .await
                        .map(|_| ())
                        .map_err(|(error, _message)| PublishError::Kafka(error.rdkafka_error_code(), error.to_string()))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_destination_takes_priority() {
        let resolved = resolve_destination("stripe", Some("overridden-topic"), "webhooks.", ".raw");
        assert_eq!(resolved, "overridden-topic");
    }

    #[test]
    fn falls_back_to_prefix_provider_suffix() {
        let resolved = resolve_destination("stripe", None, "webhooks.", ".raw");
        assert_eq!(resolved, "webhooks.stripe.raw");
    }

    #[test]
    fn empty_custom_destination_falls_back_too() {
        let resolved = resolve_destination("stripe", Some(""), "webhooks.", ".raw");
        assert_eq!(resolved, "webhooks.stripe.raw");
    }

    #[test]
    fn message_too_large_is_not_retryable() {
        let error = PublishError::Kafka(Some(RDKafkaErrorCode::MessageSizeTooLarge), "too big".to_string());
        assert!(!is_retryable(&error));
    }

    #[test]
    fn topic_authorization_failure_is_not_retryable() {
        let error = PublishError::Kafka(Some(RDKafkaErrorCode::TopicAuthorizationFailed), "denied".to_string());
        assert!(!is_retryable(&error));
    }

    #[test]
    fn request_timeout_is_retryable() {
        let error = PublishError::Kafka(Some(RDKafkaErrorCode::RequestTimedOut), "timed out".to_string());
        assert!(is_retryable(&error));
    }

    #[test]
    fn unclassified_kafka_error_defaults_to_retryable() {
        let error = PublishError::Kafka(None, "transport failure".to_string());
        assert!(is_retryable(&error));
    }

    #[test]
    fn serialize_errors_are_never_retryable() {
        let error = PublishError::Serialize(serde_json::from_str::<serde_json::Value>("not json").unwrap_err());
        assert!(!is_retryable(&error));
    }
}
