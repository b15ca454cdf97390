use axum::{body::Body, http::Request, middleware, routing::get, Router};
use sl_telemetry::metrics::{global_metrics, names, MetricsCollector};
use sl_telemetry::tracing_setup::{
    envelope_span, generate_trace_id, new_traceparent, parse_traceparent, request_id_middleware,
};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Counters / gauges
// ---------------------------------------------------------------------------

#[test]
fn test_counter_increment() {
    let m = MetricsCollector::new();
    assert_eq!(m.get_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]), 0);

    m.increment_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]);
    m.increment_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]);
    m.increment_counter(names::ENVELOPES_TOTAL, &[("direction", "outbound")]);

    assert_eq!(m.get_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]), 2);
    assert_eq!(m.get_counter(names::ENVELOPES_TOTAL, &[("direction", "outbound")]), 1);
}

#[test]
fn test_counter_labels_are_order_independent() {
    let m = MetricsCollector::new();
    m.increment_counter(names::OUTBOX_ACKS_TOTAL, &[("outcome", "completed"), ("hub", "a")]);
    m.increment_counter(names::OUTBOX_ACKS_TOTAL, &[("hub", "a"), ("outcome", "completed")]);
    assert_eq!(m.get_counter(names::OUTBOX_ACKS_TOTAL, &[("outcome", "completed"), ("hub", "a")]), 2);
    assert_eq!(m.get_counter(names::OUTBOX_ACKS_TOTAL, &[("outcome", "completed")]), 0);
}

#[test]
fn test_gauge_set() {
    let m = MetricsCollector::new();
    assert_eq!(m.get_gauge(names::NODES_ONLINE), 0);
    m.set_gauge(names::NODES_ONLINE, 3);
    assert_eq!(m.get_gauge(names::NODES_ONLINE), 3);
    m.set_gauge(names::NODES_ONLINE, 0);
    assert_eq!(m.get_gauge(names::NODES_ONLINE), 0);
}

#[test]
fn test_histogram_record() {
    let m = MetricsCollector::new();
    m.record_histogram(names::DRAIN_DURATION_SECONDS, 0.05);
    m.record_histogram(names::DRAIN_DURATION_SECONDS, 0.5);
    m.record_histogram(names::DRAIN_DURATION_SECONDS, 2.0);

    assert_eq!(m.histogram_count(names::DRAIN_DURATION_SECONDS), 3);
    let output = m.export_prometheus();
    assert!(output.contains("outbox_drain_duration_seconds_bucket{le=\"0.05\"} 1"), "{output}");
    assert!(output.contains("outbox_drain_duration_seconds_bucket{le=\"0.5\"} 2"));
    assert!(output.contains("outbox_drain_duration_seconds_bucket{le=\"5\"} 3"));
    assert!(output.contains("outbox_drain_duration_seconds_bucket{le=\"+Inf\"} 3"));
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[test]
fn test_prometheus_export_format() {
    let m = MetricsCollector::new();
    m.increment_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]);
    m.increment_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]);
    m.increment_counter(names::CLAIM_REJECTIONS_TOTAL, &[]);
    m.set_gauge(names::OBSERVERS_ONLINE, 4);
    m.record_histogram(names::DRAIN_DURATION_SECONDS, 0.123);

    let output = m.export_prometheus();

    assert!(output.contains("# TYPE bridge_envelopes_total counter"));
    assert!(
        output.contains("bridge_envelopes_total{direction=\"inbound\"} 2"),
        "missing counter value line, output: {}",
        output
    );
    assert!(output.contains("bridge_claim_rejections_total 1"));
    assert!(output.contains("# TYPE bridge_observers_online gauge"));
    assert!(output.contains("bridge_observers_online 4"));
    assert!(output.contains("# TYPE outbox_drain_duration_seconds histogram"));
    assert!(output.contains("outbox_drain_duration_seconds_bucket{le=\"+Inf\"} 1"));
    assert!(output.contains("outbox_drain_duration_seconds_count 1"));
}

#[test]
fn test_global_metrics_singleton() {
    let a = global_metrics() as *const MetricsCollector;
    let b = global_metrics() as *const MetricsCollector;
    assert_eq!(a, b);

    global_metrics().increment_counter("telemetry_test_singleton", &[]);
    assert!(global_metrics().get_counter("telemetry_test_singleton", &[]) >= 1);
}

#[test]
fn test_concurrent_counter_updates() {
    let m = std::sync::Arc::new(MetricsCollector::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let m = m.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.increment_counter(names::HANDLER_FAILURES_TOTAL, &[]);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(m.get_counter(names::HANDLER_FAILURES_TOTAL, &[]), 8000);
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

#[test]
fn test_traceparent_round_trip() {
    let tp = new_traceparent();
    let parsed = parse_traceparent(&tp).expect("valid");
    assert!(tp.contains(&parsed.trace_id));
    assert!(tp.contains(&parsed.parent_id));
}

#[test]
fn test_envelope_span_accepts_garbage_traceparent() {
    let _a = envelope_span(Some("not-a-traceparent"), "KickPlayer");
    let _b = envelope_span(None, "ServerHeartbeat");
    let _c = envelope_span(Some(&new_traceparent()), "ChatMessage");
}

#[tokio::test]
async fn test_request_id_middleware_generates_id() {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn(request_id_middleware));

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert_eq!(id.len(), 32);
}

#[tokio::test]
async fn test_request_id_middleware_reuses_incoming_id() {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn(request_id_middleware));

    let incoming = generate_trace_id();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", &incoming)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        resp.headers().get("x-request-id").unwrap().to_str().unwrap(),
        incoming
    );
}
