//! Concrete `ConnectivityProbe` impls for the worker binary (spec.md
//! §4.14, C14): broker reachability and a KV round-trip against the same
//! `IdempotencyStore` the processor host uses for real work.

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use webhook_core::health::{ConnectivityProbe, ProbeResult};
use webhook_core::idempotency::IdempotencyStore;

/// Confirms the broker is reachable by fetching cluster metadata through
/// an already-connected producer handle. rdkafka has no call literally
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

/// Round-trips a synthetic key through acquire → mark-processed →
/// is-processed → release on the live `IdempotencyStore` (spec.md §4.14
/// "round-trip write + read + delete of a synthetic key; on mismatch →
/// DOWN").
pub struct IdempotencyStoreProbe {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyStoreProbe {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    async fn round_trip(&self) -> anyhow::Result<()> {
        let key = format!("healthcheck:{}", uuid::Uuid::new_v4());
        if !self.store.try_acquire(&key, self.ttl).await? {
            anyhow::bail!("could not acquire synthetic health-check key");
        }
        self.store.mark_processed(&key, self.ttl).await?;
        if !self.store.is_processed(&key).await? {
            anyhow::bail!("synthetic health-check key was not observed as processed");
        }
        self.store.release(&key).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectivityProbe for IdempotencyStoreProbe {
    fn name(&self) -> &str {
        "kv"
    }

    async fn check(&self) -> ProbeResult {
        match self.round_trip().await {
            Ok(()) => ProbeResult::up("kv"),
            Err(error) => ProbeResult::down("kv", error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webhook_core::idempotency::InMemoryIdempotencyStore;

    #[tokio::test]
    async fn reports_up_when_the_round_trip_succeeds() {
        let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
        let probe = IdempotencyStoreProbe::new(store, Duration::from_secs(5));
        assert!(probe.check().await.is_up());
    }

    struct NeverAcquiresStore;

    #[async_trait]
    impl IdempotencyStore for NeverAcquiresStore {
        async fn try_acquire(&self, _key: &str, _lock_duration: Duration) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn is_processed(&self, _key: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn mark_processed(&self, _key: &str, _ttl: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn release(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn record_failure(&self, _key: &str, _error: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn failure_count(&self, _key: &str) -> anyhow::Result<u32> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn reports_down_when_the_store_cannot_acquire_the_synthetic_key() {
        let store: Arc<dyn IdempotencyStore> = Arc::new(NeverAcquiresStore);
        let probe = IdempotencyStoreProbe::new(store, Duration::from_secs(5));
        assert!(!probe.check().await.is_up());
    }
}
