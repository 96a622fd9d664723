//! Typed configuration for the ingress role (spec.md §4.17, C17).
//!
//! Follows the teacher's `Config::from_env` shape: every field has an
//! explicit default, malformed values fail startup with a precise error,
//! and unknown environment variables are silently ignored. Per-provider
//! overrides for rate limits, destination and the IP allowlist layer an
//! optional TOML file (env vars still win) read from
//! `WEBHOOK_PROVIDER_CONFIG_PATH`.

use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub kafka_brokers: String,
    pub kafka_topic_prefix: String,
    pub kafka_topic_suffix: String,
    pub kafka_dlq_topic: String,
    pub provider_name_pattern: String,
    pub max_payload_bytes: usize,
    pub allowed_content_types: Vec<String>,
    pub require_content_type: bool,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub compression_min_size: usize,
    pub compression_enabled: bool,
    pub batching_enabled: bool,
    pub batch_max_size: usize,
    pub batch_max_wait: Duration,
    pub batch_buffer_size: usize,
    pub ip_rate_limit_per_minute: u32,
    pub ip_rate_limit_burst: u32,
    pub ip_rate_limit_refresh_period: Duration,
    pub provider_rate_limit_per_minute: u32,
    pub provider_rate_limit_burst: u32,
    pub provider_rate_limit_refresh_period: Duration,
    pub rate_limit_timeout: Duration,
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
    pub publish_timeout: Duration,
    pub http_idempotency_ttl: Duration,
    pub provider_overrides: HashMap<String, ProviderOverride>,
    provider_allowlists: HashMap<String, Vec<IpNet>>,
}

/// Per-provider overrides layered under environment variables (spec.md §4.17).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOverride {
    pub rate_limit_per_minute: Option<u32>,
    pub ip_allowlist: Option<Vec<String>>,
    pub custom_destination: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderOverridesFile {
    #[serde(default)]
    provider: HashMap<String, ProviderOverride>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let content_types_raw =
            env::var("WEBHOOK_ALLOWED_CONTENT_TYPES").unwrap_or_else(|_| "application/json".to_string());
        let allowed_content_types = content_types_raw
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        let trusted_proxy_cidrs = env::var("WEBHOOK_TRUSTED_PROXY_CIDRS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                value
                    .parse::<IpNet>()
                    .with_context(|| format!("invalid trusted proxy cidr: {value}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let provider_overrides = match env::var("WEBHOOK_PROVIDER_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => load_provider_overrides(Path::new(&path))?,
            _ => HashMap::new(),
        };

        // Parsed eagerly so a malformed CIDR/IP entry fails startup with a
        // precise error (spec.md §4.17) instead of silently falling open
        // to "allow all" the first time a request for that provider arrives.
        let mut provider_allowlists = HashMap::new();
        for (provider, override_) in &provider_overrides {
            let Some(entries) = &override_.ip_allowlist else {
                continue;
            };
            let parsed = entries
                .iter()
                .map(|entry| parse_ip_entry(entry))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("provider {provider} ip_allowlist"))?;
            provider_allowlists.insert(provider.clone(), parsed);
        }

        let config = Self {
            bind_addr: env::var("WEBHOOK_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            kafka_brokers: required_env("KAFKA_BROKERS")?,
            kafka_topic_prefix: env::var("WEBHOOK_TOPIC_PREFIX").unwrap_or_default(),
            kafka_topic_suffix: env::var("WEBHOOK_TOPIC_SUFFIX").unwrap_or_default(),
            kafka_dlq_topic: env::var("WEBHOOK_DLQ_TOPIC").unwrap_or_else(|_| "webhooks.dlq".to_string()),
            provider_name_pattern: env::var("WEBHOOK_PROVIDER_NAME_PATTERN")
                .unwrap_or_else(|_| "^[a-z0-9-]+$".to_string()),
            max_payload_bytes: env_usize("WEBHOOK_MAX_PAYLOAD_BYTES", 1_048_576)?,
            allowed_content_types,
            require_content_type: env_bool("WEBHOOK_REQUIRE_CONTENT_TYPE", true)?,
            trust_proxy_headers: env_bool("WEBHOOK_TRUST_PROXY_HEADERS", false)?,
            trusted_proxy_cidrs,
            compression_min_size: env_usize("WEBHOOK_COMPRESSION_MIN_SIZE", 1024)?,
            compression_enabled: env_bool("WEBHOOK_COMPRESSION_ENABLED", false)?,
            batching_enabled: env_bool("WEBHOOK_BATCHING_ENABLED", false)?,
            batch_max_size: env_usize("WEBHOOK_BATCH_MAX_SIZE", 50)?,
            batch_max_wait: Duration::from_millis(env_u64("WEBHOOK_BATCH_MAX_WAIT_MS", 500)?),
            batch_buffer_size: env_usize("WEBHOOK_BATCH_BUFFER_SIZE", 1000)?,
            ip_rate_limit_per_minute: env_u32("WEBHOOK_IP_RATE_LIMIT_PER_MINUTE", 300)?,
            ip_rate_limit_burst: env_u32("WEBHOOK_IP_RATE_LIMIT_BURST", 50)?,
            ip_rate_limit_refresh_period: Duration::from_millis(env_u64("WEBHOOK_IP_RATE_LIMIT_PERIOD_MS", 60_000)?),
            provider_rate_limit_per_minute: env_u32("WEBHOOK_PROVIDER_RATE_LIMIT_PER_MINUTE", 6000)?,
            provider_rate_limit_burst: env_u32("WEBHOOK_PROVIDER_RATE_LIMIT_BURST", 200)?,
            provider_rate_limit_refresh_period: Duration::from_millis(env_u64(
                "WEBHOOK_PROVIDER_RATE_LIMIT_PERIOD_MS",
                60_000,
            )?),
            rate_limit_timeout: Duration::from_millis(env_u64("WEBHOOK_RATE_LIMIT_TIMEOUT_MS", 500)?),
            circuit_breaker_min_calls: env_usize("WEBHOOK_CB_MIN_CALLS", 10)?,
            circuit_breaker_window_size: env_usize("WEBHOOK_CB_WINDOW_SIZE", 20)?,
            circuit_breaker_failure_rate: env_f64("WEBHOOK_CB_FAILURE_RATE", 0.5)?,
            circuit_breaker_open_duration: Duration::from_secs(env_u64("WEBHOOK_CB_OPEN_SECONDS", 30)?),
            circuit_breaker_half_open_successes: env_usize("WEBHOOK_CB_HALF_OPEN_PROBES", 5)?,
            circuit_breaker_slow_call_duration: Duration::from_secs(env_u64("WEBHOOK_CB_SLOW_CALL_SECONDS", 5)?),
            circuit_breaker_slow_call_rate: env_f64("WEBHOOK_CB_SLOW_CALL_RATE", 0.5)?,
            retry_max_attempts: env_u32("WEBHOOK_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(env_u64("WEBHOOK_RETRY_BASE_DELAY_MS", 200)?),
            retry_max_delay: Duration::from_secs(env_u64("WEBHOOK_RETRY_MAX_DELAY_SECONDS", 10)?),
            retry_jitter_fraction: env_f64("WEBHOOK_RETRY_JITTER_FRACTION", 0.2)?,
            publish_timeout: Duration::from_secs(env_u64("WEBHOOK_PUBLISH_TIMEOUT_SECONDS", 10)?),
            http_idempotency_ttl: Duration::from_secs(env_u64(
                "WEBHOOK_HTTP_IDEMPOTENCY_TTL_SECONDS",
                24 * 60 * 60,
            )?),
            provider_overrides,
            provider_allowlists,
        };

        if config.max_payload_bytes == 0 {
            return Err(anyhow!("WEBHOOK_MAX_PAYLOAD_BYTES must be greater than 0"));
        }
        if config.allowed_content_types.is_empty() {
            return Err(anyhow!("WEBHOOK_ALLOWED_CONTENT_TYPES cannot be empty"));
        }

        Ok(config)
    }

    /// The ip allowlist configured for a provider, already parsed and
    /// validated during `from_env`. An empty or unconfigured allowlist
    /// means "allow all" (spec.md §4.1).
    pub fn ip_allowlist_for(&self, provider: &str) -> &[IpNet] {
        self.provider_allowlists.get(provider).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn custom_destination_for(&self, provider: &str) -> Option<&str> {
        self.provider_overrides
            .get(provider)
            .and_then(|o| o.custom_destination.as_deref())
    }

    pub fn provider_rate_limit_for(&self, provider: &str) -> u32 {
        self.provider_overrides
            .get(provider)
            .and_then(|o| o.rate_limit_per_minute)
            .unwrap_or(self.provider_rate_limit_per_minute)
    }
}

fn parse_ip_entry(entry: &str) -> Result<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<std::net::IpAddr>()
        .map(IpNet::from)
        .with_context(|| format!("invalid ip allowlist entry: {entry}"))
}

fn load_provider_overrides(path: &Path) -> Result<HashMap<String, ProviderOverride>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read provider override file at {}", path.display()))?;
    let parsed: ProviderOverridesFile =
        toml::from_str(&raw).with_context(|| format!("parse provider override file at {}", path.display()))?;
    Ok(parsed.provider)
}

fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required env var {name} cannot be empty"));
    }
    Ok(value)
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid bool for {name}: {value}")),
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
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

    #[test]
    fn ip_entry_parses_exact_address_as_slash_32() {
        let net = parse_ip_entry("10.0.0.5").expect("parse");
        assert_eq!(net.prefix_len(), 32);
    }

    #[test]
    fn ip_entry_parses_cidr_range() {
        let net = parse_ip_entry("10.0.0.0/24").expect("parse");
        assert!(net.contains(&"10.0.0.200".parse::<std::net::IpAddr>().unwrap()));
    }
}
