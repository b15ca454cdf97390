use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// A fresh W3C `traceparent` value: `00-<trace>-<span>-01`.
pub fn new_traceparent() -> String {
    format!("00-{}-{}-01", generate_trace_id(), generate_span_id())
}

/// Parsed `traceparent` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub parent_id: String,
    pub sampled: bool,
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Parse a version-00 `traceparent`. Returns `None` for anything malformed,
/// including the all-zero trace / parent ids.
pub fn parse_traceparent(value: &str) -> Option<TraceParent> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() || version != "00" {
        return None;
    }
    if !is_lower_hex(trace_id, 32) || !is_lower_hex(parent_id, 16) || !is_lower_hex(flags, 2) {
        return None;
    }
    if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some(TraceParent {
        trace_id: trace_id.to_string(),
        parent_id: parent_id.to_string(),
        sampled: flags & 0x01 == 0x01,
    })
}

/// Span for handling one envelope, joined to the sender's trace when the
/// envelope carries a valid `traceparent`.
pub fn envelope_span(trace_parent: Option<&str>, message_type: &str) -> tracing::Span {
    let trace_id = trace_parent
        .and_then(parse_traceparent)
        .map(|tp| tp.trace_id)
        .unwrap_or_else(generate_trace_id);
    tracing::info_span!(
        "envelope",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        message_type = %message_type,
    )
}

/// Axum middleware that injects `X-Request-Id` headers and creates a tracing
/// span for each request.
///
/// An incoming `X-Request-Id` is reused; otherwise a new trace ID is generated.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_trace_id);

    request.headers_mut().insert(
        "x-request-id",
        request_id
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("unknown")),
    );

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let _guard = span.enter();
    tracing::debug!(trace_id = %request_id, "processing request");

    let mut response = next.run(request).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn new_traceparent_parses() {
        let tp = parse_traceparent(&new_traceparent()).expect("valid traceparent");
        assert!(tp.sampled);
        assert_eq!(tp.trace_id.len(), 32);
    }

    #[test]
    fn rejects_malformed_traceparents() {
        assert!(parse_traceparent("").is_none());
        assert!(parse_traceparent("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7").is_none());
    }

    #[test]
    fn unsampled_flag() {
        let tp =
            parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00").unwrap();
        assert!(!tp.sampled);
        assert_eq!(tp.parent_id, "00f067aa0ba902b7");
    }
}
