//! Per-request validation (spec.md §4.1, C1): provider-name regex, payload
//! size, content-type, IP allowlist.

use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BadRequest,
    PayloadTooLarge,
    UnsupportedMediaType,
    Forbidden,
}

impl RejectReason {
    pub fn as_metric_tag(&self) -> &'static str {
        match self {
            RejectReason::BadRequest => "bad_request",
            RejectReason::PayloadTooLarge => "payload_too_large",
            RejectReason::UnsupportedMediaType => "unsupported_media_type",
            RejectReason::Forbidden => "forbidden",
        }
    }
}

pub struct ValidationRequest<'a> {
    pub provider_name: &'a str,
    pub payload_len: usize,
    pub content_type: Option<&'a str>,
    pub source_ip: IpAddr,
}

/// Validates a request against the configured rules. An empty `allowlist`
/// means "allow all" for that provider (spec.md §4.1).
pub fn validate(
    request: &ValidationRequest<'_>,
    provider_name_pattern: &Regex,
    max_payload_size: usize,
    allowed_content_types: &[String],
    require_content_type: bool,
    allowlist: &[IpNet],
) -> Result<(), RejectReason> {
    if request.provider_name.is_empty() || !provider_name_pattern.is_match(request.provider_name) {
        return Err(RejectReason::BadRequest);
    }

    if request.payload_len > max_payload_size {
        return Err(RejectReason::PayloadTooLarge);
    }

    match request.content_type {
        None if require_content_type => return Err(RejectReason::BadRequest),
        Some(content_type) => {
            let first_token = content_type.split(';').next().unwrap_or("").trim();
            if !allowed_content_types.iter().any(|allowed| allowed == first_token) {
                return Err(RejectReason::UnsupportedMediaType);
            }
        }
        None => {}
    }

    if !allowlist.is_empty() && !allowlist.iter().any(|net| net.contains(&request.source_ip)) {
        return Err(RejectReason::Forbidden);
    }

    Ok(())
}
