//! Uptrace Exporter
//!
//! Producer-side egress pipeline for traces and metrics: finished spans and
//! metric aggregations are batched in process, transformed into denormalized
//! wire records, encoded as MessagePack, compressed with the Snappy frame
//! format and posted to the project endpoint derived from a DSN.
//!
//! ```text
//! on_span_end ──▶ BatchProcessor ──▶ transform ──▶ Encoder ──▶ Gate ──▶ DeliveryClient ──▶ endpoint
//! MetricProducer ─▶ PeriodicReader ──┘
//! ```
//!
//! Memory, concurrency and retry cost are bounded: the span queue drops its
//! oldest records when full, a shared [`Gate`] limits concurrent exports, and
//! each delivery makes at most `max_retries + 1` attempts.
//!
//! # Example
//!
//! ```rust,no_run
//! use uptrace_exporter::{Config, SpanData, Status, Uptrace};
//!
//! # async fn run() {
//! let uptrace = Uptrace::builder(
//!     Config::from_env()
//!         .with_service_name("checkout")
//!         .with_service_version("1.0.0"),
//! )
//! .build();
//!
//! let mut span = SpanData::new(0x5b8aa5a2d2c872e8321cf37308d69df2, 0x051581bf3cb55c13, 0, "GET /cart");
//! span.set_attribute("http.status_code", 200);
//! span.end(Status::ok());
//! uptrace.on_span_end(span);
//!
//! uptrace.shutdown().await.ok();
//! # }
//! ```

mod invariants;

pub mod batch_processor;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod dsn;
pub mod encoding;
pub mod exporter;
pub mod gate;
pub mod global;
pub mod metric;
pub mod metric_reader;
pub mod processor;
pub mod span;
pub mod transform;
pub mod uptrace;

// Re-export main types
pub use batch_processor::{Batch, BatchConfig, BatchQueue, ProcessorState, PushOutcome};
pub use client::{DeliveryClient, DeliveryError, RetryConfig};
pub use config::{Config, ConfigError, DISABLED_ENV, DSN_ENV};
pub use dispatch::ExportMetrics;
pub use dsn::{Dsn, DsnError};
pub use encoding::{EncodeError, Encoder, EncoderPool, PooledEncoder};
pub use exporter::{ExportError, Exporter, ExporterBoxed, NoopExporter, Telemetry, UptraceExporter};
pub use gate::{Gate, GateError, GatePermit};
pub use metric::{Aggregation, Descriptor, HistogramData, InstrumentKind, MetricData, Number, Temporality};
pub use metric_reader::{MetricProducer, PeriodicReader, ReaderConfig};
pub use processor::{BatchProcessor, BatchSpanProcessor, ProcessorError};
pub use span::{
    Array, Event, InstrumentationScope, KeyValue, Link, Resource, SpanData, SpanKind, Status,
    StatusCode, Value,
};
pub use transform::{
    AggregationKind, MetricRecord, MetricValue, MetricsPayload, SpanRecord, SpansPayload,
};
pub use uptrace::{Uptrace, UptraceBuilder};
