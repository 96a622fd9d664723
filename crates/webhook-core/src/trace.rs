//! B3 trace context propagation (spec.md §4.16, C16).
//!
//! Extracts `X-B3-TraceId` / `X-B3-SpanId` / `X-Request-ID` from inbound
//! headers, generating fresh ids when absent, and exposes the values the
//! ingress and worker attach to their `tracing::Span`s and forward to the
//! next hop.

use crate::signatures::HeaderLookup;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub request_id: String,
}

impl TraceContext {
    /// B3 trace/span ids are 16-byte hex strings; a new trace gets a fresh
    /// random id rather than reusing the request id, so fan-out across
    /// providers/destinations for the same HTTP request still shares one
    /// trace id end to end.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn extract_or_new(headers: &dyn HeaderLookup) -> Self {
        let trace_id = headers
            .get_header(TRACE_ID_HEADER)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(new_trace_id);
        let span_id = headers
            .get_header(SPAN_ID_HEADER)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(new_span_id);
        let request_id = headers
            .get_header(REQUEST_ID_HEADER)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            trace_id,
            span_id,
            request_id,
        }
    }

    /// The span id a downstream call should present as its own trace id is
    /// unchanged; a fresh span id is minted for the child hop.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            request_id: self.request_id.clone(),
        }
    }

    pub fn outbound_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (TRACE_ID_HEADER, self.trace_id.clone()),
            (SPAN_ID_HEADER, self.span_id.clone()),
            (REQUEST_ID_HEADER, self.request_id.clone()),
        ]
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    // B3 span ids are 8 bytes (16 hex chars); truncate a v4 uuid's hex form.
    let full = Uuid::new_v4().simple().to_string();
    full[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn extracts_present_headers_verbatim() {
        let mut headers = BTreeMap::new();
        headers.insert("X-B3-TraceId".to_string(), "abc123".to_string());
        headers.insert("X-B3-SpanId".to_string(), "def456".to_string());
        headers.insert("X-Request-ID".to_string(), "req-1".to_string());

        let context = TraceContext::extract_or_new(&headers);
        assert_eq!(context.trace_id, "abc123");
        assert_eq!(context.span_id, "def456");
        assert_eq!(context.request_id, "req-1");
    }

    #[test]
    fn generates_fresh_ids_when_headers_absent() {
        let headers: BTreeMap<String, String> = BTreeMap::new();
        let context = TraceContext::extract_or_new(&headers);
        assert!(!context.trace_id.is_empty());
        assert!(!context.span_id.is_empty());
        assert!(!context.request_id.is_empty());
    }

    #[test]
    fn child_context_keeps_trace_id_but_mints_new_span_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);
    }
}
