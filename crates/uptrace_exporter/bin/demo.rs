//! # Uptrace Exporter Demo
//!
//! Generates a few traces and a counter metric and ships them to the project
//! named by `UPTRACE_DSN`.
//!
//! ## Running
//!
//! ```bash
//! UPTRACE_DSN=https://<token>@uptrace.dev/<project_id> \
//!   RUST_LOG=uptrace_exporter=debug,demo=info \
//!   cargo run -p uptrace_exporter --bin demo -- --quick
//! ```
//!
//! Without a DSN the pipeline is disabled and the demo only logs what it
//! would have sent.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uptrace_exporter::{
    Aggregation, BatchConfig, Config, Descriptor, InstrumentKind, InstrumentationScope, KeyValue,
    MetricData, Number, ReaderConfig, SpanData, SpanKind, Status, Uptrace,
};

const OPERATIONS: &[(&str, SpanKind)] = &[
    ("GET /products", SpanKind::Server),
    ("SELECT products", SpanKind::Client),
    ("cache.get", SpanKind::Client),
    ("render", SpanKind::Internal),
];

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let quick = std::env::args().any(|arg| arg == "--quick");
    let traces = if quick { 5 } else { 50 };

    let requests = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&requests);

    let config = Config::from_env()
        .with_service_name("demo")
        .with_service_version(env!("CARGO_PKG_VERSION"))
        .with_deployment_environment("dev")
        .with_batch(BatchConfig::default().with_flush_interval(Duration::from_secs(1)))
        .with_metrics(ReaderConfig::default().with_interval(Duration::from_secs(2)));

    let uptrace = Uptrace::builder(config)
        .metric_producer(move || {
            vec![MetricData::new(
                Descriptor::new("demo.requests", InstrumentKind::Counter)
                    .with_description("Requests handled by the demo")
                    .with_unit("1"),
                Aggregation::Sum(Number::U64(counter.load(Ordering::Relaxed))),
                uptrace_exporter::span::unix_nanos(),
            )]
        })
        .build();

    if !uptrace.is_enabled() {
        tracing::warn!("UPTRACE_DSN is not set; spans are generated but not exported");
    }

    let mut rng = rand::thread_rng();
    for _ in 0..traces {
        let trace_id: u128 = rng.gen();
        let root_id: u64 = rng.gen();
        let scope = InstrumentationScope::new("demo").with_version(env!("CARGO_PKG_VERSION"));

        for (i, (name, kind)) in OPERATIONS.iter().enumerate() {
            let (span_id, parent_id) = if i == 0 {
                (root_id, 0)
            } else {
                (rng.gen(), root_id)
            };
            let mut span = SpanData::new(trace_id, span_id, parent_id, *name)
                .with_kind(*kind)
                .with_scope(scope.clone());
            span.set_attribute("demo.iteration", i as i64);
            if *kind == SpanKind::Client {
                span.set_attribute("peer.service", "postgres");
            }

            tokio::time::sleep(Duration::from_millis(rng.gen_range(1..5))).await;

            if rng.gen_bool(0.1) {
                span.add_event(
                    "exception",
                    vec![
                        KeyValue::new("exception.type", "Timeout"),
                        KeyValue::new("exception.message", "upstream timed out"),
                    ],
                );
                span.end(Status::error("upstream timed out"));
            } else {
                span.end(Status::ok());
            }
            uptrace.on_span_end(span);
        }

        requests.fetch_add(1, Ordering::Relaxed);
        if let Some(url) = uptrace.trace_url(trace_id) {
            tracing::info!(%url, "trace recorded");
        }
    }

    if let Err(err) = uptrace.shutdown().await {
        tracing::error!(error = %err, "shutdown failed");
    }

    if let Some(metrics) = uptrace.span_metrics() {
        tracing::info!(
            exported = metrics.records_exported(),
            batches = metrics.batches_exported(),
            errors = metrics.export_errors(),
            dropped = metrics.records_dropped(),
            "span export summary"
        );
    }
}
