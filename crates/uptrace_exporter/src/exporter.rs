use crate::batch_processor::Batch;
use crate::client::{DeliveryClient, DeliveryError};
use crate::dsn::Dsn;
use crate::encoding::{EncodeError, EncoderPool};
use crate::metric::MetricData;
use crate::span::SpanData;
use crate::transform::{metric_to_wire, span_to_wire, MetricsPayload, SpansPayload};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error types for batch export operations
#[derive(Debug, Error)]
pub enum ExportError {
    /// The batch could not be serialized or compressed
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// The batch could not be delivered
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl ExportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Delivery(DeliveryError::Cancelled))
    }
}

/// Trait for exporting batches of records to a backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`. For dynamic
/// dispatch use [`ExporterBoxed`], which every `Exporter` implements.
pub trait Exporter<R>: Send + Sync {
    /// Exports one batch. `cancel` fires when the pipeline gives up on
    /// in-flight work during shutdown.
    fn export(
        &self,
        batch: Batch<R>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Exporter`].
pub trait ExporterBoxed<R>: Send + Sync {
    fn export_boxed(
        &self,
        batch: Batch<R>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any Exporter can be used as ExporterBoxed
impl<R: Send + 'static, T: Exporter<R>> ExporterBoxed<R> for T {
    fn export_boxed(
        &self,
        batch: Batch<R>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch, cancel))
    }

    fn name(&self) -> &str {
        <T as Exporter<R>>::name(self)
    }
}

/// A signal that can be shipped to the collection endpoint.
pub trait Telemetry: Sized + Send + Sync + 'static {
    /// Upload body for one batch.
    type Payload: Serialize + Send;

    /// Signal name used in logs.
    const SIGNAL: &'static str;

    /// Converts a batch into its wire body, preserving record order.
    fn payload(records: Vec<Self>) -> Self::Payload;

    /// Endpoint accepting this signal.
    fn endpoint(dsn: &Dsn) -> String;
}

impl Telemetry for SpanData {
    type Payload = SpansPayload;
    const SIGNAL: &'static str = "spans";

    fn payload(records: Vec<Self>) -> SpansPayload {
        SpansPayload {
            spans: records.into_iter().map(span_to_wire).collect(),
        }
    }

    fn endpoint(dsn: &Dsn) -> String {
        dsn.traces_endpoint()
    }
}

impl Telemetry for MetricData {
    type Payload = MetricsPayload;
    const SIGNAL: &'static str = "metrics";

    fn payload(records: Vec<Self>) -> MetricsPayload {
        MetricsPayload {
            records: records.into_iter().map(metric_to_wire).collect(),
        }
    }

    fn endpoint(dsn: &Dsn) -> String {
        dsn.metrics_endpoint()
    }
}

/// Exporter that transforms, encodes and posts batches to the DSN's endpoint.
pub struct UptraceExporter<T> {
    endpoint: String,
    token: String,
    client: Arc<DeliveryClient>,
    pool: Arc<EncoderPool>,
    _signal: PhantomData<fn() -> T>,
}

impl<T: Telemetry> UptraceExporter<T> {
    pub fn new(dsn: &Dsn, client: Arc<DeliveryClient>, pool: Arc<EncoderPool>) -> Self {
        Self {
            endpoint: T::endpoint(dsn),
            token: dsn.token().to_string(),
            client,
            pool,
            _signal: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transforms and encodes a batch into a compressed upload body.
    pub fn encode(&self, records: Vec<T>) -> Result<Bytes, EncodeError> {
        let payload = T::payload(records);
        let mut encoder = self.pool.acquire();
        let body = encoder.encode_compressed(&payload)?;
        Ok(Bytes::copy_from_slice(body))
    }
}

impl<T: Telemetry> Exporter<T> for UptraceExporter<T> {
    async fn export(&self, batch: Batch<T>, cancel: CancellationToken) -> Result<(), ExportError> {
        let seq = batch.seq;
        let count = batch.len();
        let body = self.encode(batch.records)?;
        let size = body.len();

        self.client
            .post(&self.endpoint, &self.token, body, &cancel)
            .await?;

        tracing::trace!(
            signal = T::SIGNAL,
            seq,
            records = count,
            bytes = size,
            "batch delivered"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        T::SIGNAL
    }
}

/// Exporter that discards every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

impl<R: Send + 'static> Exporter<R> for NoopExporter {
    async fn export(&self, _batch: Batch<R>, _cancel: CancellationToken) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
