//! Distributed idempotency primitives (spec.md §3 `IdempotencyRecords`, §4.10 C10).
//!
//! The broker and the KV store are both out-of-scope external collaborators
//! (spec.md §1) — only the interface the core consumes is specified here.
//! `InMemoryIdempotencyStore` is the reference implementation used by tests
//! and single-instance deployments; a production deployment backs
//! `IdempotencyStore` with Redis (or equivalent) behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub last_error: String,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic put-if-absent with TTL. Returns `true` iff this call acquired
    /// the lock (no other holder existed or the previous holder's TTL had
    /// already expired).
    async fn try_acquire(&self, key: &str, lock_duration: Duration) -> anyhow::Result<bool>;

    async fn is_processed(&self, key: &str) -> anyhow::Result<bool>;

    /// Must be called strictly after the user processor reports SUCCESS and
    /// strictly before `release` (spec.md §9 Open Questions: mark-then-release-then-ack).
    async fn mark_processed(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Idempotent delete — safe to call even if the key was never locked.
    async fn release(&self, key: &str) -> anyhow::Result<()>;

    async fn record_failure(&self, key: &str, error: &str) -> anyhow::Result<()>;

    async fn failure_count(&self, key: &str) -> anyhow::Result<u32>;
}

struct Expiring<V> {
    value: V,
    expires_at: Instant,
}

/// A minimal generic TTL cache, the shared building block behind both the
/// worker-side `IdempotencyStore` keyspaces and the ingress HTTP
/// idempotency cache (`idempotency:{http_key}` in spec.md §3). Mirrors the
/// teacher's `Mutex<HashMap<String, i64>>` pattern in `idempotency.rs` /
/// `middleware.rs`, generalized over the stored value type.
pub struct TtlCache<V: Clone> {
    entries: Mutex<HashMap<String, Expiring<V>>>,
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune_locked(guard: &mut HashMap<String, Expiring<V>>, now: Instant) {
        guard.retain(|_, entry| entry.expires_at > now);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.entries.lock().unwrap_or_else(|poison| poison.into_inner());
        Self::prune_locked(&mut guard, now);
        guard.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        let mut guard = self.entries.lock().unwrap_or_else(|poison| poison.into_inner());
        Self::prune_locked(&mut guard, Instant::now());
        guard.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Put-if-absent: returns `true` iff there was no live entry and this
    /// call inserted one.
    pub fn insert_if_absent(&self, key: &str, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut guard = self.entries.lock().unwrap_or_else(|poison| poison.into_inner());
        Self::prune_locked(&mut guard, now);
        if guard.contains_key(key) {
            return false;
        }
        guard.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.entries.lock().unwrap_or_else(|poison| poison.into_inner());
        guard.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    processing: TtlCache<()>,
    processed: TtlCache<DateTime<Utc>>,
    failures: TtlCache<FailureRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_acquire(&self, key: &str, lock_duration: Duration) -> anyhow::Result<bool> {
        Ok(self.processing.insert_if_absent(key, (), lock_duration))
    }

    async fn is_processed(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.processed.contains(key))
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        self.processed.insert(key, Utc::now(), ttl);
        Ok(())
    }

    async fn release(&self, key: &str) -> anyhow::Result<()> {
        self.processing.remove(key);
        Ok(())
    }

    async fn record_failure(&self, key: &str, error: &str) -> anyhow::Result<()> {
        const FAILURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
        let now = Utc::now();
        let updated = match self.failures.get(key) {
            Some(existing) => FailureRecord {
                count: existing.count + 1,
                first_failure_at: existing.first_failure_at,
                last_failure_at: now,
                last_error: error.to_string(),
            },
            None => FailureRecord {
                count: 1,
                first_failure_at: now,
                last_failure_at: now,
                last_error: error.to_string(),
            },
        };
        self.failures.insert(key, updated, FAILURE_TTL);
        Ok(())
    }

    async fn failure_count(&self, key: &str) -> anyhow::Result<u32> {
        Ok(self.failures.get(key).map(|record| record.count).unwrap_or(0))
    }
}

/// Default TTLs from spec.md §3.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_HTTP_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_lock_is_live() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn release_allows_reacquiring_the_lock() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());
        store.release("k1").await.unwrap();
        assert!(store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired_by_another_worker() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_acquire("k1", Duration::from_millis(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_acquire("k1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_is_visible_via_is_processed() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.is_processed("k1").await.unwrap());
        store.mark_processed("k1", Duration::from_secs(60)).await.unwrap();
        assert!(store.is_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn failure_count_accumulates_across_calls() {
        let store = InMemoryIdempotencyStore::new();
        store.record_failure("k1", "boom").await.unwrap();
        store.record_failure("k1", "boom again").await.unwrap();
        assert_eq!(store.failure_count("k1").await.unwrap(), 2);
    }
}
