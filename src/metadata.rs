//! Assembles `enriched_metadata` for an incoming request (spec.md §4.3, C3).

use uuid::Uuid;
use webhook_core::model::EnrichedMetadata;
use webhook_core::user_agent::parse_user_agent;

pub fn enrich(user_agent_header: Option<&str>, received_at_nanos: i64, request_size: usize) -> EnrichedMetadata {
    EnrichedMetadata {
        request_id: Uuid::new_v4().to_string(),
        received_at_nanos,
        request_size,
        user_agent: parse_user_agent(user_agent_header.unwrap_or_default()),
    }
}
