//! Token-bucket rate limiting per provider and per source IP (spec.md §4.2, C2).
//!
//! Two independent buckets apply in sequence; a permit is granted only if
//! both admit within `timeout_duration`. Adapted from the `KeyedRateLimiter`
//! pattern in `allframe-core::resilience::rate_limit` (DashMap-backed,
//! lazily-created per-key `governor::RateLimiter`), generalized to bound the
//! wait with `tokio::time::timeout` rather than blocking indefinitely, since
//! spec.md requires a 429 on denial rather than an unbounded wait. Each
//! bucket has its own `limit_for_period`/`limit_refresh_period` per spec.md
//! §4.2, rather than a fixed one-minute window.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

type Bucket = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn bucket(limit_for_period: u32, burst: u32, refresh_period: Duration) -> Bucket {
    let limit_for_period = limit_for_period.max(1);
    let burst = NonZeroU32::new(burst.max(1)).expect("max(1) is never zero");
    let interval = (refresh_period / limit_for_period).max(Duration::from_nanos(1));
    let quota = Quota::with_period(interval).expect("interval is non-zero").allow_burst(burst);
    GovernorRateLimiter::direct(quota)
}

/// Lazily-created per-key buckets, one per provider name or source IP.
pub struct KeyedRateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    pub default_limit_for_period: u32,
    default_burst: u32,
    refresh_period: Duration,
}

impl KeyedRateLimiter {
    pub fn new(default_limit_for_period: u32, default_burst: u32, refresh_period: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            default_limit_for_period,
            default_burst,
            refresh_period,
        }
    }

    fn get_or_create(&self, key: &str, limit_for_period: u32) -> Arc<Bucket> {
        if let Some(existing) = self.buckets.get(key) {
            return existing.clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(bucket(limit_for_period, self.default_burst, self.refresh_period)))
            .clone()
    }

    /// Waits up to `timeout` for a permit under `key`'s bucket, created with
    /// `limit_for_period` the first time this key is seen. Returns `false`
    /// on timeout (spec.md §4.2: "On denial... rejected with 429").
    pub async fn admit(&self, key: &str, limit_for_period: u32, timeout: Duration) -> bool {
        let limiter = self.get_or_create(key, limit_for_period);
        tokio::time::timeout(timeout, limiter.until_ready()).await.is_ok()
    }
}

/// Sequential provider-then-IP gate: a request is admitted only if both
/// buckets grant a permit (spec.md §4.2 "A permit is consumed only if both
/// buckets grant it").
pub struct RateLimitGate {
    pub provider_limiter: KeyedRateLimiter,
    pub ip_limiter: KeyedRateLimiter,
    pub timeout: Duration,
}

impl RateLimitGate {
    pub fn new(
        provider_default_limit: u32,
        provider_burst: u32,
        provider_refresh_period: Duration,
        ip_default_limit: u32,
        ip_burst: u32,
        ip_refresh_period: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider_limiter: KeyedRateLimiter::new(provider_default_limit, provider_burst, provider_refresh_period),
            ip_limiter: KeyedRateLimiter::new(ip_default_limit, ip_burst, ip_refresh_period),
            timeout,
        }
    }

    pub async fn admit(&self, provider: &str, provider_limit_for_period: u32, source_ip: &str) -> bool {
        if !self.provider_limiter.admit(provider, provider_limit_for_period, self.timeout).await {
            return false;
        }
        self.ip_limiter.admit(source_ip, self.ip_limiter.default_limit_for_period, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_within_burst_immediately() {
        let limiter = KeyedRateLimiter::new(600, 5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.admit("stripe", 600, Duration::from_millis(10)).await);
        }
    }

    #[tokio::test]
    async fn denies_past_burst_within_short_timeout() {
        let limiter = KeyedRateLimiter::new(60, 1, Duration::from_secs(60));
        assert!(limiter.admit("stripe", 60, Duration::from_millis(10)).await);
        assert!(!limiter.admit("stripe", 60, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn independent_keys_do_not_share_a_bucket() {
        let limiter = KeyedRateLimiter::new(60, 1, Duration::from_secs(60));
        assert!(limiter.admit("stripe", 60, Duration::from_millis(10)).await);
        assert!(limiter.admit("github", 60, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn gate_requires_both_buckets_to_admit() {
        let gate = RateLimitGate::new(
            60,
            1,
            Duration::from_secs(60),
            60,
            1,
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        assert!(gate.admit("stripe", 60, "1.2.3.4").await);
        assert!(!gate.admit("stripe", 60, "1.2.3.4").await);
    }

    /// spec.md §8 scenario 4: `limit=100, period=1s, timeout=500ms`. A
    /// sub-minute refresh period must be constructible and must admit all
    /// of a burst-sized batch immediately.
    #[tokio::test]
    async fn honors_a_configured_sub_minute_refresh_period() {
        let limiter = KeyedRateLimiter::new(100, 100, Duration::from_secs(1));
        for _ in 0..100 {
            assert!(limiter.admit("stripe", 100, Duration::from_millis(500)).await);
        }
        assert!(!limiter.admit("stripe", 100, Duration::from_millis(10)).await);
    }
}
