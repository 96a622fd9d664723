//! Best-effort dead-letter publish (spec.md §4.8, C8). Failures are logged
//! and swallowed: the DLQ write must never block or fail the request that
//! triggered it.

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, warn};
use webhook_core::model::{RejectionCategory, WebhookEnvelope, WebhookRejectedEvent};

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
}

impl DlqWriter {
    pub fn new(producer: FutureProducer, topic: String, send_timeout: Duration) -> Self {
        Self {
            producer,
            topic,
            send_timeout,
        }
    }

    pub async fn write(
        &self,
        envelope: WebhookEnvelope,
        category: RejectionCategory,
        reason: impl Into<String>,
        error_details: Option<String>,
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
            retry_count: None,
            exception_type: None,
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(event_id = %event_id, %error, "failed to serialize dead-letter event");
                return;
            }
        };

        let category_label = rejection_category_label(category);
        let rejected_at_rfc3339 = rejected_at.to_rfc3339();
        let headers = rdkafka::message::OwnedHeaders::new()
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
                value: Some(category_label),
            })
            .insert(rdkafka::message::Header {
                key: "rejectedAt",
                value: Some(rejected_at_rfc3339.as_str()),
            });

        let record = FutureRecord::to(&self.topic).key(&event_id).payload(&payload).headers(headers);
        if let Err((error, _message)) = self.producer.send(record, Timeout::After(self.send_timeout)).await {
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
