//! Record Transformer: in-memory span/metric records to wire records.
//!
//! Wire records are denormalized: every span carries its own resource and
//! scope fields so the backend can ingest a batch without cross references.
//! Attribute lists are copied in their original order at every scope
//! (resource, span, event, link) and never deduplicated.

use crate::invariants::debug_assert_buckets_aligned;
use crate::metric::{Aggregation, HistogramData, MetricData, Temporality};
use crate::span::{Array, KeyValue, SpanData, SpanKind, StatusCode, Value};
use serde::{Deserialize, Serialize};

/// Attribute value on the wire. Integers are `i64`, floats are `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<AttrValue>),
}

/// Attribute on the wire, encoded as a two element array `[key, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr(pub String, pub AttrValue);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub attrs: Vec<Attr>,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    #[serde(with = "id_bytes")]
    pub trace_id: u128,
    pub span_id: u64,
    pub attrs: Vec<Attr>,
}

/// Span as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: u64,
    pub parent_id: u64,
    #[serde(with = "id_bytes")]
    pub trace_id: u128,
    pub name: String,
    pub kind: String,
    pub start_time: u64,
    pub end_time: u64,
    pub resource: Vec<Attr>,
    pub attrs: Vec<Attr>,
    pub status_code: String,
    pub status_message: String,
    pub tracer_name: String,
    pub tracer_version: String,
    pub events: Vec<EventRecord>,
    pub links: Vec<LinkRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    Sum,
    Histogram,
    MinMaxSumCount,
    LastValue,
}

impl AggregationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationKind::Sum => "sum",
            AggregationKind::Histogram => "histogram",
            AggregationKind::MinMaxSumCount => "min-max-sum-count",
            AggregationKind::LastValue => "last-value",
        }
    }
}

/// Aggregation payload; the variant is the aggregation discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Sum {
        value: f64,
    },
    Histogram {
        sum: f64,
        count: u64,
        bounds: Vec<f64>,
        counts: Vec<u64>,
    },
    MinMaxSumCount {
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
    },
    LastValue {
        value: f64,
        time: u64,
    },
}

impl MetricValue {
    pub fn kind(&self) -> AggregationKind {
        match self {
            MetricValue::Sum { .. } => AggregationKind::Sum,
            MetricValue::Histogram { .. } => AggregationKind::Histogram,
            MetricValue::MinMaxSumCount { .. } => AggregationKind::MinMaxSumCount,
            MetricValue::LastValue { .. } => AggregationKind::LastValue,
        }
    }
}

/// Metric aggregation as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub instrument: String,
    pub temporality: Temporality,
    pub resource: Vec<Attr>,
    pub attrs: Vec<Attr>,
    pub time: u64,
    pub value: MetricValue,
}

impl MetricRecord {
    pub fn aggregation(&self) -> AggregationKind {
        self.value.kind()
    }
}

/// Body of a span upload: `{"spans": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpansPayload {
    pub spans: Vec<SpanRecord>,
}

/// Body of a metric upload: `{"records": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub records: Vec<MetricRecord>,
}

/// Converts a finished span into its wire record.
pub fn span_to_wire(span: SpanData) -> SpanRecord {
    SpanRecord {
        id: span.span_id,
        parent_id: span.parent_span_id,
        trace_id: span.trace_id,
        name: span.name,
        kind: span_kind_str(span.kind).to_string(),
        start_time: span.start_time,
        end_time: span.end_time,
        resource: attrs_from_slice(span.resource.attributes()),
        attrs: attrs(span.attributes),
        status_code: status_code_str(span.status.code).to_string(),
        status_message: span.status.message,
        tracer_name: span.scope.name,
        tracer_version: span.scope.version.unwrap_or_default(),
        events: span
            .events
            .into_iter()
            .map(|event| EventRecord {
                name: event.name,
                attrs: attrs(event.attributes),
                time: event.time,
            })
            .collect(),
        links: span
            .links
            .into_iter()
            .map(|link| LinkRecord {
                trace_id: link.trace_id,
                span_id: link.span_id,
                attrs: attrs(link.attributes),
            })
            .collect(),
    }
}

/// Converts one metric aggregation into its wire record.
pub fn metric_to_wire(metric: MetricData) -> MetricRecord {
    let value = match metric.aggregation {
        Aggregation::Sum(sum) => MetricValue::Sum {
            value: sum.as_f64(),
        },
        Aggregation::Histogram(HistogramData {
            sum,
            count,
            boundaries,
            counts,
        }) => {
            let counts = align_buckets(&boundaries, counts);
            debug_assert_buckets_aligned!(boundaries, counts);
            MetricValue::Histogram {
                sum: sum.as_f64(),
                count,
                bounds: boundaries,
                counts,
            }
        }
        Aggregation::MinMaxSumCount {
            min,
            max,
            sum,
            count,
        } => MetricValue::MinMaxSumCount {
            min: min.as_f64(),
            max: max.as_f64(),
            sum: sum.as_f64(),
            count,
        },
        Aggregation::LastValue { value, time } => MetricValue::LastValue {
            value: value.as_f64(),
            time,
        },
    };

    MetricRecord {
        name: metric.descriptor.name,
        description: metric.descriptor.description,
        unit: metric.descriptor.unit,
        instrument: metric.descriptor.instrument.as_str().to_string(),
        temporality: metric.temporality,
        resource: attrs_from_slice(metric.resource.attributes()),
        attrs: attrs(metric.attributes),
        time: metric.time,
        value,
    }
}

/// Makes `counts.len() == boundaries.len() + 1`.
///
/// Missing buckets are zero; surplus counts belong to the overflow bucket.
fn align_buckets(boundaries: &[f64], mut counts: Vec<u64>) -> Vec<u64> {
    let want = boundaries.len() + 1;
    if counts.len() < want {
        counts.resize(want, 0);
    } else if counts.len() > want {
        let surplus = counts
            .drain(want..)
            .fold(0_u64, |acc, c| acc.saturating_add(c));
        counts[want - 1] = counts[want - 1].saturating_add(surplus);
    }
    counts
}

pub fn status_code_str(code: StatusCode) -> &'static str {
    match code {
        StatusCode::Unset => "unset",
        StatusCode::Ok => "ok",
        StatusCode::Error => "error",
    }
}

pub fn span_kind_str(kind: SpanKind) -> &'static str {
    match kind {
        SpanKind::Internal => "internal",
        SpanKind::Server => "server",
        SpanKind::Client => "client",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
    }
}

fn attrs(kvs: Vec<KeyValue>) -> Vec<Attr> {
    kvs.into_iter()
        .map(|kv| Attr(kv.key, attr_value(kv.value)))
        .collect()
}

fn attrs_from_slice(kvs: &[KeyValue]) -> Vec<Attr> {
    kvs.iter()
        .map(|kv| Attr(kv.key.clone(), attr_value(kv.value.clone())))
        .collect()
}

fn attr_value(value: Value) -> AttrValue {
    match value {
        Value::Bool(v) => AttrValue::Bool(v),
        Value::I64(v) => AttrValue::Int(v),
        Value::F64(v) => AttrValue::Float(v),
        Value::String(v) => AttrValue::Str(v),
        Value::Array(Array::Bool(vs)) => {
            AttrValue::Array(vs.into_iter().map(AttrValue::Bool).collect())
        }
        Value::Array(Array::I64(vs)) => {
            AttrValue::Array(vs.into_iter().map(AttrValue::Int).collect())
        }
        Value::Array(Array::F64(vs)) => {
            AttrValue::Array(vs.into_iter().map(AttrValue::Float).collect())
        }
        Value::Array(Array::String(vs)) => {
            AttrValue::Array(vs.into_iter().map(AttrValue::Str).collect())
        }
    }
}

/// 128-bit identifiers travel as 16 raw big-endian bytes.
mod id_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(id: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&id.to_be_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_bytes(IdVisitor)
    }

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("16 bytes")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<u128, E> {
            let bytes: [u8; 16] = v
                .try_into()
                .map_err(|_| E::invalid_length(v.len(), &self))?;
            Ok(u128::from_be_bytes(bytes))
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<u128, A::Error> {
            let mut bytes = [0_u8; 16];
            for (i, slot) in bytes.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            }
            Ok(u128::from_be_bytes(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Descriptor, InstrumentKind, Number};
    use crate::span::{InstrumentationScope, Resource, Status};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn sample_span() -> SpanData {
        let resource = Arc::new(Resource::new(vec![
            KeyValue::new("service.name", "checkout"),
            KeyValue::new("host.name", "web-1"),
        ]));
        let mut span = SpanData::new(0xfeed, 7, 3, "SELECT")
            .with_kind(SpanKind::Client)
            .with_resource(resource)
            .with_scope(InstrumentationScope::new("sqlx").with_version("0.8"));
        span.set_attribute("db.system", "postgresql");
        span.set_attribute("service.name", "db-override");
        span.set_attribute("db.rows", 12_i32);
        span.set_attribute("tags", Array::String(vec!["a".into(), "b".into()]));
        span.add_event("retry", vec![KeyValue::new("attempt", 2_i64)]);
        span.add_link(0xbeef, 9, vec![KeyValue::new("kind", "follows")]);
        span.end(Status::error("timeout"));
        span
    }

    #[test]
    fn test_span_to_wire() {
        let span = sample_span();
        let start = span.start_time;
        let record = span_to_wire(span);

        assert_eq!(record.id, 7);
        assert_eq!(record.parent_id, 3);
        assert_eq!(record.trace_id, 0xfeed);
        assert_eq!(record.kind, "client");
        assert_eq!(record.start_time, start);
        assert_eq!(record.status_code, "error");
        assert_eq!(record.status_message, "timeout");
        assert_eq!(record.tracer_name, "sqlx");
        assert_eq!(record.tracer_version, "0.8");
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].attrs, vec![Attr("attempt".into(), AttrValue::Int(2))]);
        assert_eq!(record.links[0].trace_id, 0xbeef);
        assert_eq!(record.links[0].span_id, 9);
    }

    #[test]
    fn test_attribute_order_and_scopes_preserved() {
        let record = span_to_wire(sample_span());

        let resource_keys: Vec<_> = record.resource.iter().map(|a| a.0.as_str()).collect();
        assert_eq!(resource_keys, ["service.name", "host.name"]);

        // Same key at span scope is kept next to the resource one.
        let span_keys: Vec<_> = record.attrs.iter().map(|a| a.0.as_str()).collect();
        assert_eq!(span_keys, ["db.system", "service.name", "db.rows", "tags"]);
        assert_eq!(record.attrs[2].1, AttrValue::Int(12));
        assert_eq!(
            record.attrs[3].1,
            AttrValue::Array(vec![AttrValue::Str("a".into()), AttrValue::Str("b".into())])
        );
    }

    #[test]
    fn test_status_mapping() {
        for (code, expected) in [(0, "unset"), (1, "error"), (2, "ok"), (99, "unset")] {
            let mut span = SpanData::new(1, 1, 0, "op");
            span.status.code = StatusCode::from_code(code);
            assert_eq!(span_to_wire(span).status_code, expected);
        }
    }

    #[test]
    fn test_metric_numbers_widen_to_f64() {
        let sum = MetricData::new(
            Descriptor::new("requests", InstrumentKind::Counter).with_unit("1"),
            Aggregation::Sum(Number::I64(41)),
            10,
        );
        let record = metric_to_wire(sum);
        assert_eq!(record.value, MetricValue::Sum { value: 41.0 });
        assert_eq!(record.aggregation(), AggregationKind::Sum);
        assert_eq!(record.instrument, "counter");
        assert_eq!(record.unit, "1");

        let mmsc = MetricData::new(
            Descriptor::new("latency", InstrumentKind::Histogram),
            Aggregation::MinMaxSumCount {
                min: Number::U64(1),
                max: Number::F64(9.5),
                sum: Number::I64(20),
                count: 4,
            },
            10,
        );
        assert_eq!(
            metric_to_wire(mmsc).value,
            MetricValue::MinMaxSumCount {
                min: 1.0,
                max: 9.5,
                sum: 20.0,
                count: 4
            }
        );
    }

    #[test]
    fn test_last_value() {
        let gauge = MetricData::new(
            Descriptor::new("queue.depth", InstrumentKind::ObservableGauge),
            Aggregation::LastValue {
                value: Number::I64(3),
                time: 99,
            },
            100,
        )
        .with_temporality(Temporality::Delta);
        let record = metric_to_wire(gauge);
        assert_eq!(record.aggregation(), AggregationKind::LastValue);
        assert_eq!(record.temporality, Temporality::Delta);
        assert_eq!(record.value, MetricValue::LastValue { value: 3.0, time: 99 });
    }

    #[test]
    fn test_histogram_buckets_aligned() {
        let short = align_buckets(&[1.0, 5.0, 10.0], vec![2, 3]);
        assert_eq!(short, vec![2, 3, 0, 0]);

        let long = align_buckets(&[1.0], vec![1, 2, 3, 4]);
        assert_eq!(long, vec![1, 9]);

        let exact = align_buckets(&[], vec![7]);
        assert_eq!(exact, vec![7]);
    }

    proptest! {
        #[test]
        fn prop_histogram_invariant(
            boundaries in prop::collection::vec(0.0f64..1000.0, 0..20),
            counts in prop::collection::vec(0u64..1000, 0..25),
        ) {
            let total: u64 = counts.iter().sum();
            let metric = MetricData::new(
                Descriptor::new("h", InstrumentKind::Histogram),
                Aggregation::Histogram(HistogramData {
                    sum: Number::F64(0.0),
                    count: total,
                    boundaries,
                    counts,
                }),
                0,
            );
            match metric_to_wire(metric).value {
                MetricValue::Histogram { bounds, counts, .. } => {
                    prop_assert_eq!(counts.len(), bounds.len() + 1);
                    prop_assert_eq!(counts.iter().sum::<u64>(), total);
                }
                other => prop_assert!(false, "unexpected value {:?}", other),
            }
        }
    }
}
