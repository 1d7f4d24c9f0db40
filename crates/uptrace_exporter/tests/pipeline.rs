//! End-to-end tests: spans and metrics go through the whole pipeline to a
//! mock Uptrace server.

use std::time::Duration;
use uptrace_exporter::encoding::decode_compressed;
use uptrace_exporter::transform::AttrValue;
use uptrace_exporter::{
    Aggregation, BatchConfig, Config, Descriptor, InstrumentKind, MetricData, MetricValue,
    MetricsPayload, Number, RetryConfig, SpanData, SpanKind, SpansPayload, Status, Uptrace,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SPANS_PATH: &str = "/api/v1/tracing/1/spans";
const METRICS_PATH: &str = "/api/v1/metrics/1/measures";

fn config_for(server: &MockServer) -> Config {
    Config::default()
        .with_dsn(format!("http://token@{}/1", server.address()))
        .with_service_name("checkout")
        .with_retry(
            RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20)),
        )
}

fn finished_span(trace_id: u128, span_id: u64, name: &str) -> SpanData {
    let mut span = SpanData::new(trace_id, span_id, 0, name).with_kind(SpanKind::Server);
    span.set_attribute("http.method", "GET");
    span.end(Status::ok());
    span
}

async fn received_on(server: &MockServer, route: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path() == route)
        .collect()
}

#[tokio::test]
async fn test_spans_delivered_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SPANS_PATH))
        .and(header("authorization", "Bearer token"))
        .and(header("content-type", "application/msgpack"))
        .and(header("content-encoding", "s2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let uptrace = Uptrace::builder(config_for(&server)).try_build().unwrap();
    for i in 0..5u64 {
        uptrace.on_span_end(finished_span(0xabc, i + 1, &format!("op-{i}")));
    }
    uptrace.force_flush().await.unwrap();

    let requests = received_on(&server, SPANS_PATH).await;
    assert_eq!(requests.len(), 1);

    let payload: SpansPayload = decode_compressed(&requests[0].body).unwrap();
    let names: Vec<_> = payload.spans.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["op-0", "op-1", "op-2", "op-3", "op-4"]);

    let first = &payload.spans[0];
    assert_eq!(first.trace_id, 0xabc);
    assert_eq!(first.kind, "server");
    assert!(first
        .resource
        .iter()
        .any(|attr| attr.0 == "service.name" && attr.1 == AttrValue::Str("checkout".into())));

    let metrics = uptrace.span_metrics().unwrap();
    assert_eq!(metrics.records_exported(), 5);
    assert_eq!(metrics.export_errors(), 0);

    uptrace.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batches_split_by_size() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SPANS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = config_for(&server).with_batch(
        BatchConfig::default()
            .with_max_batch_size(2)
            .with_flush_interval(Duration::from_secs(60)),
    );
    let uptrace = Uptrace::builder(config).try_build().unwrap();
    for i in 0..5u64 {
        uptrace.on_span_end(finished_span(1, i + 1, "op"));
    }
    uptrace.shutdown().await.unwrap();

    let mut ids = Vec::new();
    let requests = received_on(&server, SPANS_PATH).await;
    for request in &requests {
        let payload: SpansPayload = decode_compressed(&request.body).unwrap();
        assert!(payload.spans.len() <= 2);
        ids.extend(payload.spans.iter().map(|s| s.id));
    }
    ids.sort_unstable();
    assert_eq!(ids, [1, 2, 3, 4, 5]);
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn test_metrics_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(METRICS_PATH))
        .and(header("authorization", "Bearer token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let uptrace = Uptrace::builder(config_for(&server))
        .metric_producer(|| {
            vec![MetricData::new(
                Descriptor::new("http.requests", InstrumentKind::Counter).with_unit("1"),
                Aggregation::Sum(Number::U64(42)),
                1_000,
            )]
        })
        .try_build()
        .unwrap();
    uptrace.force_flush().await.unwrap();

    let requests = received_on(&server, METRICS_PATH).await;
    assert!(!requests.is_empty());

    let payload: MetricsPayload = decode_compressed(&requests[0].body).unwrap();
    assert_eq!(payload.records.len(), 1);
    let record = &payload.records[0];
    assert_eq!(record.name, "http.requests");
    assert_eq!(record.instrument, "counter");
    assert_eq!(record.value, MetricValue::Sum { value: 42.0 });
    assert!(record.resource.iter().any(|attr| attr.0 == "service.name"));

    uptrace.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_errors_are_retried_then_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SPANS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let uptrace = Uptrace::builder(config_for(&server)).try_build().unwrap();
    uptrace.on_span_end(finished_span(7, 1, "flaky"));
    uptrace.force_flush().await.unwrap();

    // One attempt plus two retries.
    assert_eq!(received_on(&server, SPANS_PATH).await.len(), 3);

    let metrics = uptrace.span_metrics().unwrap();
    assert_eq!(metrics.export_errors(), 1);
    assert_eq!(metrics.records_dropped(), 1);
    assert_eq!(metrics.records_exported(), 0);

    uptrace.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SPANS_PATH))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(serde_json::json!({"message": "bad token"})),
        )
        .mount(&server)
        .await;

    let uptrace = Uptrace::builder(config_for(&server)).try_build().unwrap();
    uptrace.on_span_end(finished_span(7, 1, "denied"));
    uptrace.force_flush().await.unwrap();

    assert_eq!(received_on(&server, SPANS_PATH).await.len(), 1);
    assert_eq!(uptrace.span_metrics().unwrap().export_errors(), 1);

    uptrace.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_late_spans() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let uptrace = Uptrace::builder(config_for(&server)).try_build().unwrap();
    uptrace.shutdown().await.unwrap();

    uptrace.on_span_end(finished_span(1, 1, "late"));
    assert_eq!(uptrace.span_metrics().unwrap().records_dropped(), 1);
    assert!(received_on(&server, SPANS_PATH).await.is_empty());
}
