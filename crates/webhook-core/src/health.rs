//! Liveness and readiness probes (spec.md §4.14, C14).
//!
//! The broker and KV store are out-of-scope external collaborators
//! (spec.md §1); this module only defines the probe contract and the
//! readiness decision. The ingress binary supplies a Kafka cluster-metadata
//! probe (`src/health_probes.rs`); the worker binary supplies the same
//! Kafka probe plus a round-trip probe against its live `IdempotencyStore`
//! (`apps/webhook-worker/src/health_probes.rs`).

use crate::resilience::CircuitState;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: ProbeStatus,
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn up(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProbeStatus::Up,
            detail: None,
        }
    }

    pub fn down(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProbeStatus::Down,
            detail: Some(detail.into()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == ProbeStatus::Up
    }
}

/// A round-trip connectivity check against an out-of-scope external
/// collaborator (broker or KV store).
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ProbeResult;
}

/// Liveness never inspects external state: a running process is always UP
/// (spec.md §4.14).
pub fn liveness() -> ProbeResult {
    ProbeResult::up("liveness")
}

/// Readiness is UP iff every named circuit breaker is CLOSED or HALF_OPEN
/// and every connectivity probe reports UP.
pub async fn readiness(
    breaker_states: &[(&str, CircuitState)],
    probes: &[Box<dyn ConnectivityProbe>],
) -> Vec<ProbeResult> {
    let mut results: Vec<ProbeResult> = breaker_states
        .iter()
        .map(|(name, state)| match state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                ProbeResult::up(format!("circuit_breaker:{name}"))
            }
            CircuitState::Open => ProbeResult::down(
                format!("circuit_breaker:{name}"),
                "circuit breaker is open",
            ),
        })
        .collect();

    for probe in probes {
        results.push(probe.check().await);
    }

    results
}

pub fn all_up(results: &[ProbeResult]) -> bool {
    results.iter().all(ProbeResult::is_up)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysUpProbe;

    #[async_trait]
    impl ConnectivityProbe for AlwaysUpProbe {
        fn name(&self) -> &str {
            "always_up"
        }
        async fn check(&self) -> ProbeResult {
            ProbeResult::up(self.name())
        }
    }

    struct AlwaysDownProbe;

    #[async_trait]
    impl ConnectivityProbe for AlwaysDownProbe {
        fn name(&self) -> &str {
            "always_down"
        }
        async fn check(&self) -> ProbeResult {
            ProbeResult::down(self.name(), "synthetic failure")
        }
    }

    #[test]
    fn liveness_is_always_up() {
        assert!(liveness().is_up());
    }

    #[tokio::test]
    async fn readiness_is_down_when_a_breaker_is_open() {
        let results = readiness(&[("broker", CircuitState::Open)], &[]).await;
        assert!(!all_up(&results));
    }

    #[tokio::test]
    async fn readiness_is_up_when_breakers_closed_and_probes_pass() {
        let probes: Vec<Box<dyn ConnectivityProbe>> = vec![Box::new(AlwaysUpProbe)];
        let results = readiness(&[("broker", CircuitState::Closed)], &probes).await;
        assert!(all_up(&results));
    }

    #[tokio::test]
    async fn readiness_is_down_when_a_probe_fails() {
        let probes: Vec<Box<dyn ConnectivityProbe>> = vec![Box::new(AlwaysDownProbe)];
        let results = readiness(&[("broker", CircuitState::Closed)], &probes).await;
        assert!(!all_up(&results));
    }
}
