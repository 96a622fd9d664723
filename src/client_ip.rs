//! Client IP extraction used by the IP allowlist (C1) and the per-IP rate
//! limiter (C2). Adapted from the teacher's `TrustedClientIpKeyExtractor`,
//! which implemented `tower_governor`'s `KeyExtractor` trait; this version
//! is a plain function since rate limiting here is done directly against
//! `governor` rather than through a `tower` middleware layer.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Resolves the client IP for a request given the directly-connected peer
/// address. When `trust_proxy_headers` is false, or the peer is not among
/// `trusted_proxy_cidrs`, the peer address is authoritative and forwarding
/// headers are ignored (spec.md §4.1: never trust forwarding headers from
/// an untrusted peer).
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer_ip: IpAddr,
    trust_proxy_headers: bool,
    trusted_proxy_cidrs: &[IpNet],
) -> IpAddr {
    if !trust_proxy_headers || !is_trusted_proxy(peer_ip, trusted_proxy_cidrs) {
        return peer_ip;
    }

    parse_x_forwarded_for(headers)
        .or_else(|| parse_x_real_ip(headers))
        .or_else(|| parse_forwarded(headers))
        .unwrap_or(peer_ip)
}

fn is_trusted_proxy(peer_ip: IpAddr, trusted_proxy_cidrs: &[IpNet]) -> bool {
    trusted_proxy_cidrs.iter().any(|cidr| cidr.contains(&peer_ip))
}

fn parse_x_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .split(',')
                .find_map(|part| part.trim().parse::<IpAddr>().ok())
        })
}

fn parse_x_real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_REAL_IP)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
}

fn parse_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    headers.get("forwarded").and_then(|value| {
        value.to_str().ok().and_then(|raw| {
            raw.split(';').find_map(|segment| {
                let segment = segment.trim();
                if !segment.to_ascii_lowercase().starts_with("for=") {
                    return None;
                }
                let ip_text = segment
                    .split_once('=')
                    .map(|(_, value)| value.trim().trim_matches('"'))
                    .unwrap_or_default();
                let ip_only = ip_text
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .split(':')
                    .next()
                    .unwrap_or_default();
                ip_only.parse::<IpAddr>().ok()
            })
        })
    })
}

/// Checks a resolved client IP against a provider's allowlist. An empty
/// allowlist means "allow all" (spec.md §4.1).
pub fn is_allowed(ip: IpAddr, allowlist: &[IpNet]) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|net| net.contains(&ip))
}
