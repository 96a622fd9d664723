//! Concrete `ConnectivityProbe` impls for the ingress binary (spec.md
//! §4.14, C14). `webhook-core::health` only defines the probe contract;
//! the broker client lives here because it's an out-of-scope external
//! collaborator from the core crate's point of view.

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use webhook_core::health::{ConnectivityProbe, ProbeResult};

/// Confirms the broker is reachable by fetching cluster metadata through
/// the already-connected producer handle. rdkafka has no call literally
/// named `describe_cluster`; `fetch_metadata` is its cluster-describe
/// equivalent and is what this probe uses.
pub struct KafkaConnectivityProbe {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaConnectivityProbe {
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl ConnectivityProbe for KafkaConnectivityProbe {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn check(&self) -> ProbeResult {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        // fetch_metadata blocks the calling thread on the librdkafka C
        // client, so it runs off the async runtime's worker threads.
        let outcome = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, Timeout::After(timeout))
        })
        .await;

        match outcome {
            Ok(Ok(_metadata)) => ProbeResult::up("kafka"),
            Ok(Err(error)) => ProbeResult::down("kafka", error.to_string()),
            Err(join_error) => ProbeResult::down("kafka", join_error.to_string()),
        }
    }
}
