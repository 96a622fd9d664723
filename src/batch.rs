//! Per-destination bounded buffering with (max-size, max-wait) flush
//! (spec.md §4.5, C5). Each destination gets its own sink, created lazily
//! on first submission, modeled as a bounded channel plus a task that
//! flushes when either `max_batch_size` items have accumulated or
//! `max_wait_time` has elapsed since the first item of the current batch —
//! the re-architecture spec.md §9 prescribes for reactive `bufferTimeout`
//! chains: "a bounded channel per destination + a timer-driven flusher task".

use dashmap::DashMap;
use futures_util::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webhook_core::model::WebhookEnvelope;

pub struct BatchItem {
    pub envelope: WebhookEnvelope,
}

type FlushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type FlushFn = Arc<dyn Fn(String, Vec<BatchItem>) -> FlushFuture + Send + Sync>;

struct DestinationSink {
    tx: mpsc::Sender<BatchItem>,
    task: JoinHandle<()>,
}

/// Lazily-created per-destination batching sinks. `submit` returns `false`
/// when the sink's buffer is full, signaling the caller to fall back to
/// direct publish (spec.md §4.5 "when full, the submission falls back to
/// direct publish").
pub struct Batcher {
    sinks: DashMap<String, Arc<DestinationSink>>,
    max_batch_size: usize,
    max_wait: Duration,
    buffer_size: usize,
    flush: FlushFn,
}

impl Batcher {
    pub fn new(max_batch_size: usize, max_wait: Duration, buffer_size: usize, flush: FlushFn) -> Self {
        Self {
            sinks: DashMap::new(),
            max_batch_size,
            max_wait,
            buffer_size,
            flush,
        }
    }

    pub fn submit(&self, destination: &str, item: BatchItem) -> bool {
        let sink = self.get_or_create(destination);
        sink.tx.try_send(item).is_ok()
    }

    fn get_or_create(&self, destination: &str) -> Arc<DestinationSink> {
        if let Some(existing) = self.sinks.get(destination) {
            return existing.clone();
        }
        self.sinks
            .entry(destination.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
                let task = tokio::spawn(run_sink(
                    rx,
                    destination.to_string(),
                    self.max_batch_size.max(1),
                    self.max_wait,
                    self.flush.clone(),
                ));
                Arc::new(DestinationSink { tx, task })
            })
            .clone()
    }

    /// Closes every sink's channel and waits up to `drain_timeout` for the
    /// final flush of pending items (spec.md §4.5 "on shutdown the sink is
    /// marked complete and all pending items are flushed with bounded wait").
    pub async fn shutdown(self, drain_timeout: Duration) {
        let mut handles = Vec::new();
        for (_, sink) in self.sinks.into_iter() {
            if let Ok(sink) = Arc::try_unwrap(sink) {
                drop(sink.tx);
                handles.push(sink.task);
            } else {
                // Another submitter still holds a sender clone; the sink's
                // own task still observes channel closure once all clones
                // drop, so we just wait on it directly.
            }
        }
        let _ = tokio::time::timeout(drain_timeout, join_all(handles)).await;
    }
}

async fn run_sink(
    mut rx: mpsc::Receiver<BatchItem>,
    destination: String,
    max_batch_size: usize,
    max_wait: Duration,
    flush: FlushFn,
) {
    let mut batch: Vec<BatchItem> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = match deadline {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(item) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + max_wait);
                        }
                        batch.push(item);
                        if batch.len() >= max_batch_size {
                            flush(destination.clone(), std::mem::take(&mut batch)).await;
                            deadline = None;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(destination.clone(), std::mem::take(&mut batch)).await;
                        }
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(sleep), if deadline.is_some() => {
                flush(destination.clone(), std::mem::take(&mut batch)).await;
                deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use webhook_core::model::{EnrichedMetadata, HeaderMap};
    use webhook_core::user_agent::parse_user_agent;

    fn sample_item() -> BatchItem {
        BatchItem {
            envelope: WebhookEnvelope {
                event_id: uuid::Uuid::new_v4().to_string(),
                provider_name: "stripe".to_string(),
                payload: Some(serde_json::json!({"id":"evt_1"})),
                compressed_payload: None,
                compressed: false,
                algorithm: None,
                headers: HeaderMap::new(),
                query_params: HeaderMap::new(),
                received_at: chrono::Utc::now(),
                source_ip: "127.0.0.1".to_string(),
                http_method: "POST".to_string(),
                correlation_id: None,
                enriched_metadata: EnrichedMetadata {
                    request_id: "req-1".to_string(),
                    received_at_nanos: 0,
                    request_size: 10,
                    user_agent: parse_user_agent(""),
                },
            },
        }
    }

    #[tokio::test]
    async fn flushes_when_max_batch_size_reached() {
        let flush_count = Arc::new(AtomicUsize::new(0));
        let counted = flush_count.clone();
        let flush: FlushFn = Arc::new(move |_dest, items| {
            let counted = counted.clone();
            let len = items.len();
            Box::pin(async move {
                counted.fetch_add(len, Ordering::SeqCst);
            })
        });

        let batcher = Batcher::new(2, Duration::from_secs(10), 16, flush);
        assert!(batcher.submit("stripe", sample_item()));
        assert!(batcher.submit("stripe", sample_item()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flush_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flushes_after_max_wait_elapses_with_a_partial_batch() {
        let flush_count = Arc::new(AtomicUsize::new(0));
        let counted = flush_count.clone();
        let flush: FlushFn = Arc::new(move |_dest, items| {
            let counted = counted.clone();
            let len = items.len();
            Box::pin(async move {
                counted.fetch_add(len, Ordering::SeqCst);
            })
        });

        let batcher = Batcher::new(100, Duration::from_millis(20), 16, flush);
        assert!(batcher.submit("stripe", sample_item()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(flush_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_rejects_when_buffer_is_full() {
        let flush: FlushFn = Arc::new(|_dest, _items| Box::pin(async {}));
        let batcher = Batcher::new(100, Duration::from_secs(10), 1, flush);
        assert!(batcher.submit("stripe", sample_item()));
        assert!(!batcher.submit("stripe", sample_item()));
    }
}
