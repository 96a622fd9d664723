//! Kafka consumer runtime (spec.md §4.12, C12).
//!
//! Same `StreamConsumer` + manual-commit shape as the teacher's
//! `kafka-openclaw-hook` consumer, widened with a `tokio::sync::Semaphore`
//! bounding in-flight messages — grounded in the PostHog hook-worker's
//! `acquire_many_owned` batch-dispatch loop, the closest semaphore-bounded
//! worker pattern in the retrieved pack.

use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::Semaphore;
use tracing::{error, warn};
use webhook_core::model::HeaderMap;
use webhook_core::trace::TraceContext;

use crate::config::WorkerConfig;
use crate::processor_host::{HostOutcome, WebhookProcessorHost};

pub struct ConsumerRuntime {
    consumer: Arc<StreamConsumer>,
    host: Arc<WebhookProcessorHost>,
    semaphore: Arc<Semaphore>,
}

impl ConsumerRuntime {
    pub fn from_config(config: &WorkerConfig, host: Arc<WebhookProcessorHost>) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.kafka_group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .context("create kafka stream consumer")?;

        let topic_refs = config.kafka_topics.iter().map(String::as_str).collect::<Vec<_>>();
        consumer
            .subscribe(&topic_refs)
            .with_context(|| format!("subscribe to topics: {}", topic_refs.join(",")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            host,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_messages)),
        })
    }

    pub async fn run(&self) -> Result<()> {
        tracing::info!("webhook worker consumer started");

        loop {
            match self.consumer.recv().await {
                Ok(message) => self.dispatch(message).await,
                Err(error) => warn!(%error, "kafka poll error"),
            }
        }
    }

    async fn dispatch(&self, message: BorrowedMessage<'_>) {
        let payload_bytes = match message.payload() {
            Some(bytes) => bytes.to_vec(),
            None => {
                warn!("kafka message missing payload, committing to skip");
                self.commit(&message);
                return;
            }
        };

        let kafka_headers = snapshot_kafka_headers(&message);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let consumer = self.consumer.clone();
        let host = self.host.clone();
        let topic = message.topic().to_string();
        let partition = message.partition();
        let offset = message.offset();

        tokio::spawn(async move {
            let _permit = permit;
            let trace = TraceContext::extract_or_new(&kafka_headers);
            let span = tracing::info_span!("process_webhook_message", trace_id = %trace.trace_id, %topic, partition, offset);
            let _entered = span.enter();

            let envelope = match serde_json::from_slice(&payload_bytes) {
                Ok(envelope) => envelope,
                Err(error) => {
                    error!(%error, "failed to deserialize webhook envelope, committing to skip poison message");
                    commit_at(&consumer, &topic, partition, offset);
                    return;
                }
            };

            match host.handle(envelope).await {
                HostOutcome::Ack => commit_at(&consumer, &topic, partition, offset),
                HostOutcome::Nack { retry_after } => {
                    if let Some(delay) = retry_after {
                        tokio::time::sleep(delay).await;
                    }
                    // Offset intentionally left uncommitted: the broker will
                    // redeliver this message on the next rebalance or restart.
                }
            }
        });
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(error) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(%error, "failed to commit kafka offset");
        }
    }
}

fn commit_at(consumer: &StreamConsumer, topic: &str, partition: i32, offset: i64) {
    let mut tpl = rdkafka::TopicPartitionList::new();
    if let Err(error) = tpl.add_partition_offset(topic, partition, rdkafka::Offset::Offset(offset + 1)) {
        warn!(%error, %topic, partition, "failed to build commit offset");
        return;
    }
    if let Err(error) = consumer.commit(&tpl, CommitMode::Async) {
        warn!(%error, %topic, partition, offset, "failed to commit kafka offset");
    }
}

fn snapshot_kafka_headers(message: &BorrowedMessage<'_>) -> HeaderMap {
    use rdkafka::message::Headers;

    let mut headers = HeaderMap::new();
    if let Some(kafka_headers) = message.headers() {
        for idx in 0..kafka_headers.count() {
            let header = kafka_headers.get(idx);
            if let Some(value) = header.value.and_then(|bytes| std::str::from_utf8(bytes).ok()) {
                headers.insert(header.key.to_string(), value.to_string());
            }
        }
    }
    headers
}
