//! The consumer-supplied business logic seam (spec.md §4.13, C13).
//!
//! `webhook-relay` never decides what a webhook *means* — that is the one
//! piece every adopting team brings themselves. This module defines the
//! trait boundary the host drives and a reference `LoggingProcessor` that
//! only proves the wiring; production deployments register their own.

use async_trait::async_trait;
use webhook_core::model::WebhookEnvelope;

/// What a `WebhookProcessor::process` call decided to do with one envelope.
/// The host maps each variant onto ack/nack/DLQ per spec.md §4.13's state
/// table.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Success,
    Skipped { reason: String },
    Retry { delay_seconds: u64 },
    Failed { reason: String },
}

#[async_trait]
pub trait WebhookProcessor: Send + Sync {
    /// The provider name this processor handles, matched against the
    /// envelope's normalized `provider_name`.
    fn provider_name(&self) -> &str;

    /// Runs before the idempotency key is touched; a processor can use this
    /// to short-circuit work it already knows is irrelevant, but the host
    /// still owns the actual idempotency decision.
    async fn before_process(&self, _envelope: &WebhookEnvelope) {}

    async fn process(&self, envelope: &WebhookEnvelope) -> anyhow::Result<ProcessingOutcome>;

    /// Runs only after a `Success` outcome has been durably marked
    /// processed, never before (spec.md §4.13's mark-before-ack ordering).
    async fn after_process(&self, _envelope: &WebhookEnvelope, _outcome: &ProcessingOutcome) {}
}

/// Proves the host wiring end to end without encoding any real business
/// decision: every envelope is logged and acknowledged.
pub struct LoggingProcessor {
    provider: String,
}

impl LoggingProcessor {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl WebhookProcessor for LoggingProcessor {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn process(&self, envelope: &WebhookEnvelope) -> anyhow::Result<ProcessingOutcome> {
        tracing::info!(
            event_id = %envelope.event_id,
            provider = %envelope.provider_name,
            "processed webhook"
        );
        Ok(ProcessingOutcome::Success)
    }
}

/// Resolves an envelope's provider to its registered `WebhookProcessor`,
/// falling back to a catch-all when no provider-specific one is registered.
pub struct ProcessorRegistry {
    processors: std::collections::HashMap<String, Box<dyn WebhookProcessor>>,
    fallback: Box<dyn WebhookProcessor>,
}

impl ProcessorRegistry {
    pub fn new(fallback: Box<dyn WebhookProcessor>) -> Self {
        Self {
            processors: std::collections::HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, processor: Box<dyn WebhookProcessor>) {
        self.processors.insert(processor.provider_name().to_string(), processor);
    }

    pub fn resolve(&self, provider: &str) -> &dyn WebhookProcessor {
        self.processors
            .get(provider)
            .map(|p| p.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}
