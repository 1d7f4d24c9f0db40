//! Benchmarks for the export hot path: transforming span batches into wire
//! records, then MessagePack encoding and Snappy framing.
//!
//! Compares a fresh [`Encoder`] per batch against one reused through the
//! [`EncoderPool`].
//!
//! Run with: cargo bench -p uptrace_exporter --bench encoding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use uptrace_exporter::transform::span_to_wire;
use uptrace_exporter::{
    Encoder, EncoderPool, KeyValue, Resource, SpanData, SpanKind, SpansPayload, Status,
};

const BATCH_SIZES: &[usize] = &[10, 100, 1000];

fn make_spans(n: usize) -> Vec<SpanData> {
    let resource = Arc::new(Resource::new(vec![
        KeyValue::new("service.name", "bench"),
        KeyValue::new("host.name", "bench-host"),
    ]));
    (0..n)
        .map(|i| {
            let mut span = SpanData::new(0x1234_5678_9abc_def0, i as u64 + 1, 0, "GET /api/items")
                .with_kind(SpanKind::Server)
                .with_resource(Arc::clone(&resource));
            span.set_attribute("http.method", "GET");
            span.set_attribute("http.status_code", 200);
            span.set_attribute("http.route", "/api/items/:id");
            span.add_event("cache.miss", vec![KeyValue::new("key", format!("item:{i}"))]);
            span.end(Status::ok());
            span
        })
        .collect()
}

fn payload(n: usize) -> SpansPayload {
    SpansPayload {
        spans: make_spans(n).into_iter().map(span_to_wire).collect(),
    }
}

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");

    for &size in BATCH_SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || make_spans(size),
                |spans| black_box(spans.into_iter().map(span_to_wire).collect::<Vec<_>>()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_compressed");

    for &size in BATCH_SIZES {
        let payload = payload(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("fresh", size), &payload, |b, payload| {
            b.iter(|| {
                let mut encoder = Encoder::new();
                black_box(encoder.encode_compressed(payload).map(<[u8]>::len).ok());
            });
        });

        let pool = EncoderPool::default();
        group.bench_with_input(BenchmarkId::new("pooled", size), &payload, |b, payload| {
            b.iter(|| {
                let mut encoder = pool.acquire();
                black_box(encoder.encode_compressed(payload).map(<[u8]>::len).ok());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_transform, bench_encode);
criterion_main!(benches);
