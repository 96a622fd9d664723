//! Provider name to `SignatureValidator` + secret resolution (C11, worker side).
//!
//! Stripe, GitHub and Linear get their native wire conventions, reusing the
//! validators `webhook-core` already ships (spec.md §4.11); any other
//! provider name falls back to a bare-hex HMAC validator with no timestamp
//! check, per spec.md §9 "unknown providers fall back to defaults". A
//! provider with no configured secret skips validation entirely rather than
//! failing closed on every message (same header comment as the teacher's
//! `sources::github`/`sources::linear`, which only validate when a secret is
//! present).

use crate::config::WorkerConfig;
use std::collections::HashMap;
use webhook_core::signatures::{
    DefaultHmacValidator, GithubSignatureValidator, HeaderLookup, LinearSignatureValidator,
    SignatureValidator, StripeSignatureValidator,
};

const DEFAULT_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone, Copy)]
enum ValidatorKind {
    Stripe,
    Github,
    Linear,
    Default,
}

/// No secret configured for this provider: signature checks are skipped
/// entirely (spec.md §4.11).
struct NoopValidator;

impl SignatureValidator for NoopValidator {
    fn is_validation_required(&self) -> bool {
        false
    }

    fn validate(&self, _payload_bytes: &[u8], _headers: &dyn HeaderLookup, _secret: &str, _now_epoch_seconds: i64) -> bool {
        true
    }
}

pub struct ProviderRegistry {
    kinds: HashMap<String, ValidatorKind>,
    config: WorkerConfig,
}

impl ProviderRegistry {
    pub fn new(config: WorkerConfig) -> Self {
        let mut kinds = HashMap::new();
        kinds.insert("stripe".to_string(), ValidatorKind::Stripe);
        kinds.insert("github".to_string(), ValidatorKind::Github);
        kinds.insert("linear".to_string(), ValidatorKind::Linear);
        Self { kinds, config }
    }

    /// Returns the `SignatureValidator` for `provider` (falling back to a
    /// bare HMAC default) along with its configured secret. A provider with
    /// no secret configured gets a validator that never requires checking.
    pub fn resolve(&self, provider: &str) -> (Box<dyn SignatureValidator>, Option<&str>) {
        let secret = self.config.secret_for(provider);
        let Some(secret) = secret else {
            return (Box::new(NoopValidator), None);
        };

        let kind = self.kinds.get(provider).copied().unwrap_or(ValidatorKind::Default);
        let tolerance = secret
            .tolerance_seconds
            .unwrap_or(self.config.default_signature_tolerance_seconds);
        let validator: Box<dyn SignatureValidator> = match kind {
            ValidatorKind::Stripe => Box::new(StripeSignatureValidator::new("stripe-signature", tolerance)),
            ValidatorKind::Github => Box::new(GithubSignatureValidator::new("x-hub-signature-256")),
            ValidatorKind::Linear => Box::new(LinearSignatureValidator::new("linear-signature")),
            ValidatorKind::Default => Box::new(DefaultHmacValidator {
                header_name: DEFAULT_SIGNATURE_HEADER.to_string(),
                required: true,
            }),
        };
        (validator, Some(secret.secret.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSecret;
    use std::collections::BTreeMap;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;
    use webhook_core::signatures::compute_hmac_sha256_hex;

    fn base_config(secrets: StdHashMap<String, ProviderSecret>) -> WorkerConfig {
        WorkerConfig {
            kafka_brokers: "localhost:9092".to_string(),
            kafka_group_id: "test".to_string(),
            kafka_topics: vec!["webhooks.stripe".to_string()],
            kafka_dlq_topic: "webhooks.dlq".to_string(),
            max_concurrent_messages: 8,
            idempotency_lock_duration: Duration::from_secs(300),
            idempotency_processed_ttl: Duration::from_secs(604_800),
            dlq_publish_timeout: Duration::from_secs(5),
            circuit_breaker_min_calls: 10,
            circuit_breaker_window_size: 20,
            circuit_breaker_failure_rate: 0.5,
            circuit_breaker_open_duration: Duration::from_secs(30),
            circuit_breaker_half_open_successes: 5,
            circuit_breaker_slow_call_duration: Duration::from_secs(5),
            circuit_breaker_slow_call_rate: 0.5,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
            retry_jitter_fraction: 0.2,
            default_signature_tolerance_seconds: 300,
            provider_secrets: secrets,
            health_bind_addr: "0.0.0.0:8081".to_string(),
        }
    }

    #[test]
    fn provider_with_no_secret_skips_validation() {
        let config = base_config(StdHashMap::new());
        let registry = ProviderRegistry::new(config);
        let (validator, secret) = registry.resolve("stripe");
        assert!(!validator.is_validation_required());
        assert!(secret.is_none());
    }

    #[test]
    fn unknown_provider_falls_back_to_default_hmac() {
        let mut secrets = StdHashMap::new();
        secrets.insert(
            "acme".to_string(),
            ProviderSecret {
                secret: "acme-secret".to_string(),
                tolerance_seconds: None,
            },
        );
        let config = base_config(secrets);
        let registry = ProviderRegistry::new(config);
        let (validator, secret) = registry.resolve("acme");
        assert!(validator.is_validation_required());
        assert_eq!(secret, Some("acme-secret"));

        let digest = compute_hmac_sha256_hex("acme-secret", b"{}");
        let mut headers = BTreeMap::new();
        headers.insert(DEFAULT_SIGNATURE_HEADER.to_string(), digest);
        assert!(validator.validate(b"{}", &headers, "acme-secret", 0));
    }

    #[test]
    fn per_provider_tolerance_override_is_honored() {
        let mut secrets = StdHashMap::new();
        secrets.insert(
            "stripe".to_string(),
            ProviderSecret {
                secret: "whsec_test".to_string(),
                tolerance_seconds: Some(60),
            },
        );
        let config = base_config(secrets);
        let registry = ProviderRegistry::new(config);
        let (validator, secret) = registry.resolve("stripe");
        assert!(validator.is_validation_required());
        assert_eq!(secret, Some("whsec_test"));
    }
}
