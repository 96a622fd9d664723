//! Typed configuration for the worker role (spec.md §4.17, C17).
//!
//! Mirrors the ingress role's `Config::from_env` shape: explicit defaults,
//! a precise `anyhow` error on a malformed value, unknown env vars
//! ignored. Per-provider signature secrets and tolerances layer an
//! optional TOML file under environment variables.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub kafka_brokers: String,
    pub kafka_group_id: String,
    pub kafka_topics: Vec<String>,
    pub kafka_dlq_topic: String,
    pub max_concurrent_messages: usize,
    pub idempotency_lock_duration: Duration,
    pub idempotency_processed_ttl: Duration,
    pub dlq_publish_timeout: Duration,
    pub circuit_breaker_min_calls: usize,
    pub circuit_breaker_window_size: usize,
    pub circuit_breaker_failure_rate: f64,
    pub circuit_breaker_open_duration: Duration,
    pub circuit_breaker_half_open_successes: usize,
    pub circuit_breaker_slow_call_duration: Duration,
    pub circuit_breaker_slow_call_rate: f64,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter_fraction: f64,
    pub default_signature_tolerance_seconds: i64,
    pub provider_secrets: HashMap<String, ProviderSecret>,
    pub health_bind_addr: String,
}

/// Per-provider signature secret and optional timestamp tolerance override
/// (spec.md §4.11). A provider absent from this map has no configured
/// secret and its validator reports `is_validation_required() == false`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSecret {
    pub secret: String,
    pub tolerance_seconds: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSecretsFile {
    #[serde(default)]
    provider: HashMap<String, ProviderSecret>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let kafka_topics = required_env("WORKER_KAFKA_TOPICS")?
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if kafka_topics.is_empty() {
            return Err(anyhow!("WORKER_KAFKA_TOPICS cannot be empty"));
        }

        let provider_secrets = match env::var("WORKER_PROVIDER_SECRETS_PATH") {
            Ok(path) if !path.trim().is_empty() => load_provider_secrets(Path::new(&path))?,
            _ => HashMap::new(),
        };

        Ok(Self {
            kafka_brokers: required_env("KAFKA_BROKERS")?,
            kafka_group_id: env::var("WORKER_GROUP_ID").unwrap_or_else(|_| "webhook-worker".to_string()),
            kafka_topics,
            kafka_dlq_topic: env::var("WORKER_DLQ_TOPIC").unwrap_or_else(|_| "webhooks.dlq".to_string()),
            max_concurrent_messages: env_usize("WORKER_MAX_CONCURRENT_MESSAGES", 32)?,
            idempotency_lock_duration: Duration::from_secs(env_u64("WORKER_LOCK_DURATION_SECONDS", 5 * 60)?),
            idempotency_processed_ttl: Duration::from_secs(env_u64(
                "WORKER_PROCESSED_TTL_SECONDS",
                7 * 24 * 60 * 60,
            )?),
            dlq_publish_timeout: Duration::from_secs(env_u64("WORKER_DLQ_PUBLISH_TIMEOUT_SECONDS", 10)?),
            circuit_breaker_min_calls: env_usize("WORKER_CB_MIN_CALLS", 10)?,
            circuit_breaker_window_size: env_usize("WORKER_CB_WINDOW_SIZE", 20)?,
            circuit_breaker_failure_rate: env_f64("WORKER_CB_FAILURE_RATE", 0.5)?,
            circuit_breaker_open_duration: Duration::from_secs(env_u64("WORKER_CB_OPEN_SECONDS", 30)?),
            circuit_breaker_half_open_successes: env_usize("WORKER_CB_HALF_OPEN_PROBES", 5)?,
            circuit_breaker_slow_call_duration: Duration::from_secs(env_u64("WORKER_CB_SLOW_CALL_SECONDS", 5)?),
            circuit_breaker_slow_call_rate: env_f64("WORKER_CB_SLOW_CALL_RATE", 0.5)?,
            retry_max_attempts: env_u32("WORKER_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(env_u64("WORKER_RETRY_BASE_DELAY_MS", 200)?),
            retry_max_delay: Duration::from_secs(env_u64("WORKER_RETRY_MAX_DELAY_SECONDS", 10)?),
            retry_jitter_fraction: env_f64("WORKER_RETRY_JITTER_FRACTION", 0.2)?,
            default_signature_tolerance_seconds: env_u64("WORKER_SIGNATURE_TOLERANCE_SECONDS", 300)? as i64,
            provider_secrets,
            health_bind_addr: env::var("WORKER_HEALTH_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
        })
    }

    pub fn secret_for(&self, provider: &str) -> Option<&ProviderSecret> {
        self.provider_secrets.get(provider)
    }
}

fn load_provider_secrets(path: &Path) -> Result<HashMap<String, ProviderSecret>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read provider secrets file at {}", path.display()))?;
    let parsed: ProviderSecretsFile =
        toml::from_str(&raw).with_context(|| format!("parse provider secrets file at {}", path.display()))?;
    Ok(parsed.provider)
}

fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required env var {name} cannot be empty"));
    }
    Ok(value)
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse::<u32>().with_context(|| format!("invalid u32 for {name}")))
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse::<u64>().with_context(|| format!("invalid u64 for {name}")))
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse::<usize>().with_context(|| format!("invalid usize for {name}")))
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse::<f64>().with_context(|| format!("invalid f64 for {name}")))
        .transpose()
        .map(|value| value.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_provider_secrets_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [provider.stripe]
            secret = "whsec_test"
            tolerance_seconds = 600
            "#
        )
        .unwrap();

        let secrets = load_provider_secrets(file.path()).unwrap();
        assert_eq!(secrets["stripe"].secret, "whsec_test");
        assert_eq!(secrets["stripe"].tolerance_seconds, Some(600));
    }
}
