//! Process-local metrics registry (spec.md §4.15, C15).
//!
//! Same shape as the teacher's `Metrics` struct in `src/metrics.rs` — a
//! `prometheus::Registry` wrapping typed vec metrics, registered once at
//! construction and rendered on demand for `GET /metrics` — widened to the
//! full named-series list spec.md §4.15 requires.

use anyhow::{Context, Result};
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    received_total: IntCounterVec,
    published_total: IntCounterVec,
    rejected_total: IntCounterVec,
    failed_total: IntCounterVec,
    duplicates_total: IntCounterVec,
    payload_size: HistogramVec,
    processing_time: HistogramVec,
    circuit_breaker_state: IntGaugeVec,
    circuit_breaker_calls_total: IntCounterVec,
    dlq_published_total: IntCounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let received_total = IntCounterVec::new(
            prometheus::Opts::new("webhooks_received_total", "Webhooks accepted at ingress."),
            &["provider"],
        )
        .context("create webhooks_received_total")?;

        let published_total = IntCounterVec::new(
            prometheus::Opts::new("webhooks_published_total", "Webhooks published to the broker."),
            &["provider"],
        )
        .context("create webhooks_published_total")?;

        let rejected_total = IntCounterVec::new(
            prometheus::Opts::new("webhooks_rejected_total", "Webhooks rejected before publish."),
            &["provider", "reason"],
        )
        .context("create webhooks_rejected_total")?;

        let failed_total = IntCounterVec::new(
            prometheus::Opts::new("webhooks_failed_total", "Webhooks that failed worker processing."),
            &["provider", "error_type"],
        )
        .context("create webhooks_failed_total")?;

        let duplicates_total = IntCounterVec::new(
            prometheus::Opts::new("webhooks_duplicates_total", "Deliveries suppressed as duplicates."),
            &["provider"],
        )
        .context("create webhooks_duplicates_total")?;

        let payload_size = HistogramVec::new(
            prometheus::HistogramOpts::new("webhooks_payload_size_bytes", "Raw payload size in bytes."),
            &["provider"],
        )
        .context("create webhooks_payload_size_bytes")?;

        let processing_time = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "webhooks_processing_time_seconds",
                "Worker processing duration in seconds.",
            ),
            &["provider"],
        )
        .context("create webhooks_processing_time_seconds")?;

        let circuit_breaker_state = IntGaugeVec::new(
            prometheus::Opts::new(
                "circuit_breaker_state",
                "0=closed, 1=half_open, 2=open, per named breaker.",
            ),
            &["name"],
        )
        .context("create circuit_breaker_state")?;

        let circuit_breaker_calls_total = IntCounterVec::new(
            prometheus::Opts::new("circuit_breaker_calls_total", "Calls observed by a breaker."),
            &["name", "kind"],
        )
        .context("create circuit_breaker_calls_total")?;

        let dlq_published_total = IntCounterVec::new(
            prometheus::Opts::new("dlq_published_total", "Records written to the dead-letter sink."),
            &["category"],
        )
        .context("create dlq_published_total")?;

        for collector in [
            Box::new(received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(published_total.clone()),
            Box::new(rejected_total.clone()),
            Box::new(failed_total.clone()),
            Box::new(duplicates_total.clone()),
            Box::new(payload_size.clone()),
            Box::new(processing_time.clone()),
            Box::new(circuit_breaker_state.clone()),
            Box::new(circuit_breaker_calls_total.clone()),
            Box::new(dlq_published_total.clone()),
        ] {
            registry.register(collector).context("register metric collector")?;
        }

        Ok(Self {
            registry,
            received_total,
            published_total,
            rejected_total,
            failed_total,
            duplicates_total,
            payload_size,
            processing_time,
            circuit_breaker_state,
            circuit_breaker_calls_total,
            dlq_published_total,
        })
    }

    pub fn inc_received(&self, provider: &str) {
        self.received_total.with_label_values(&[provider]).inc();
    }

    pub fn inc_published(&self, provider: &str) {
        self.published_total.with_label_values(&[provider]).inc();
    }

    pub fn inc_rejected(&self, provider: &str, reason: &str) {
        self.rejected_total.with_label_values(&[provider, reason]).inc();
    }

    pub fn inc_failed(&self, provider: &str, error_type: &str) {
        self.failed_total.with_label_values(&[provider, error_type]).inc();
    }

    pub fn inc_duplicate(&self, provider: &str) {
        self.duplicates_total.with_label_values(&[provider]).inc();
    }

    pub fn observe_payload_size(&self, provider: &str, bytes: usize) {
        self.payload_size.with_label_values(&[provider]).observe(bytes as f64);
    }

    pub fn observe_processing_time(&self, provider: &str, seconds: f64) {
        self.processing_time.with_label_values(&[provider]).observe(seconds);
    }

    pub fn set_circuit_breaker_state(&self, name: &str, state: crate::resilience::CircuitState) {
        let value = match state {
            crate::resilience::CircuitState::Closed => 0,
            crate::resilience::CircuitState::HalfOpen => 1,
            crate::resilience::CircuitState::Open => 2,
        };
        self.circuit_breaker_state.with_label_values(&[name]).set(value);
    }

    pub fn inc_circuit_breaker_call(&self, name: &str, kind: &str) {
        self.circuit_breaker_calls_total.with_label_values(&[name, kind]).inc();
    }

    pub fn inc_dlq_published(&self, category: &str) {
        self.dlq_published_total.with_label_values(&[category]).inc();
    }

    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).context("encode metrics")?;
        String::from_utf8(buffer).context("metrics text is valid utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_named_series() {
        let metrics = MetricsRegistry::new().expect("construct registry");
        metrics.inc_received("stripe");
        metrics.inc_published("stripe");
        metrics.inc_rejected("stripe", "invalid_signature");
        metrics.inc_failed("stripe", "timeout");
        metrics.inc_duplicate("stripe");
        metrics.observe_payload_size("stripe", 512);
        metrics.observe_processing_time("stripe", 0.25);
        metrics.set_circuit_breaker_state("broker", crate::resilience::CircuitState::Open);
        metrics.inc_circuit_breaker_call("broker", "success");
        metrics.inc_dlq_published("validation_failed");

        let rendered = metrics.render().expect("render");
        for series in [
            "webhooks_received_total",
            "webhooks_published_total",
            "webhooks_rejected_total",
            "webhooks_failed_total",
            "webhooks_duplicates_total",
            "webhooks_payload_size_bytes",
            "webhooks_processing_time_seconds",
            "circuit_breaker_state",
            "circuit_breaker_calls_total",
            "dlq_published_total",
        ] {
            assert!(rendered.contains(series), "missing series {series}");
        }
    }
}
