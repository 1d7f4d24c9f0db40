//! The pipeline handle.
//!
//! An [`Uptrace`] value owns the span processor, the metric reader and the
//! gate they share. It is either enabled or a no-op; callers never need to
//! branch on which.

use crate::client::DeliveryClient;
use crate::config::{Config, ConfigError};
use crate::dispatch::ExportMetrics;
use crate::dsn::Dsn;
use crate::encoding::EncoderPool;
use crate::exporter::UptraceExporter;
use crate::gate::Gate;
use crate::metric::MetricData;
use crate::metric_reader::{MetricProducer, PeriodicReader};
use crate::processor::{BatchSpanProcessor, ProcessorError};
use crate::span::{Resource, SpanData};
use std::sync::Arc;

/// Handle to a running (or disabled) export pipeline.
pub struct Uptrace {
    inner: Option<Enabled>,
}

struct Enabled {
    dsn: Dsn,
    resource: Arc<Resource>,
    spans: BatchSpanProcessor,
    metrics: Option<PeriodicReader>,
    gate: Arc<Gate>,
}

impl Uptrace {
    pub fn builder(config: Config) -> UptraceBuilder {
        UptraceBuilder {
            config,
            producer: None,
        }
    }

    /// A handle that accepts and discards everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn dsn(&self) -> Option<&Dsn> {
        self.inner.as_ref().map(|inner| &inner.dsn)
    }

    /// Link to a trace in the UI, if enabled.
    pub fn trace_url(&self, trace_id: u128) -> Option<String> {
        self.dsn().map(|dsn| dsn.trace_url(trace_id))
    }

    /// Hands a finished span to the pipeline.
    ///
    /// Spans without resource attributes get the configured resource.
    pub fn on_span_end(&self, mut span: SpanData) {
        let Some(inner) = &self.inner else {
            return;
        };
        if span.resource.attributes().is_empty() {
            span.resource = Arc::clone(&inner.resource);
        }
        inner.spans.push(span);
    }

    /// Span export counters, if enabled.
    pub fn span_metrics(&self) -> Option<&Arc<ExportMetrics>> {
        self.inner.as_ref().map(|inner| inner.spans.metrics())
    }

    /// Metric export counters, if a metric producer was registered.
    pub fn metric_metrics(&self) -> Option<&Arc<ExportMetrics>> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.metrics.as_ref())
            .map(PeriodicReader::metrics)
    }

    /// Exports everything pending and waits for in-flight exports.
    pub async fn force_flush(&self) -> Result<(), ProcessorError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let spans = inner.spans.force_flush().await;
        if let Some(reader) = &inner.metrics {
            reader.force_flush().await?;
        }
        spans
    }

    /// Flushes and stops both pipelines, then closes the gate.
    ///
    /// Returns [`ProcessorError::Closed`] when called again.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let spans = inner.spans.shutdown().await;
        let metrics = match &inner.metrics {
            Some(reader) => reader.shutdown().await,
            None => Ok(()),
        };
        inner.gate.close();
        tracing::debug!(dsn = %inner.dsn, "uptrace pipeline shut down");
        spans.and(metrics)
    }
}

/// Builds an [`Uptrace`] handle from a [`Config`].
pub struct UptraceBuilder {
    config: Config,
    producer: Option<Arc<dyn MetricProducer>>,
}

impl UptraceBuilder {
    /// Registers the source of metric aggregations. Without one no metrics are exported.
    pub fn metric_producer(mut self, producer: impl MetricProducer) -> Self {
        self.producer = Some(Arc::new(producer));
        self
    }

    /// Builds the pipeline, falling back to a disabled handle on configuration errors.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Uptrace {
        match self.try_build() {
            Ok(uptrace) => uptrace,
            Err(err) => {
                tracing::error!(error = %err, "uptrace is disabled");
                Uptrace::disabled()
            }
        }
    }

    /// Builds the pipeline, returning configuration errors.
    ///
    /// Must be called within a tokio runtime.
    pub fn try_build(self) -> Result<Uptrace, ConfigError> {
        let config = self.config;
        if config.is_disabled() {
            tracing::info!("uptrace is disabled");
            return Ok(Uptrace::disabled());
        }

        let dsn = config.resolve_dsn()?;
        let client = Arc::new(DeliveryClient::new(
            config.retry.clone(),
            config.request_timeout,
        )?);
        let pool = Arc::new(EncoderPool::default());
        let gate = Arc::new(match config.max_concurrent_exports {
            Some(n) => Gate::new(n),
            None => Gate::with_available_parallelism(),
        });
        let resource = Arc::new(config.resource());

        let span_exporter =
            UptraceExporter::<SpanData>::new(&dsn, Arc::clone(&client), Arc::clone(&pool));
        let spans = BatchSpanProcessor::new(
            config.batch.clone(),
            Arc::new(span_exporter),
            Arc::clone(&gate),
        );

        let metrics = self.producer.map(|producer| {
            let exporter = UptraceExporter::<MetricData>::new(&dsn, client, pool);
            PeriodicReader::new(
                config.metrics.clone(),
                Arc::new(WithResource {
                    inner: producer,
                    resource: Arc::clone(&resource),
                }),
                Arc::new(exporter),
                Arc::clone(&gate),
            )
        });

        tracing::debug!(
            dsn = %dsn,
            gate = gate.capacity(),
            metrics = metrics.is_some(),
            "uptrace pipeline started"
        );

        Ok(Uptrace {
            inner: Some(Enabled {
                dsn,
                resource,
                spans,
                metrics,
                gate,
            }),
        })
    }
}

/// Stamps the configured resource on metrics that carry none.
struct WithResource {
    inner: Arc<dyn MetricProducer>,
    resource: Arc<Resource>,
}

impl MetricProducer for WithResource {
    fn collect(&self) -> Vec<MetricData> {
        let mut records = self.inner.collect();
        for record in &mut records {
            if record.resource.attributes().is_empty() {
                record.resource = Arc::clone(&self.resource);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_handle_is_noop() {
        let uptrace = Uptrace::builder(Config::default().with_disabled(true)).build();
        assert!(!uptrace.is_enabled());
        uptrace.on_span_end(SpanData::new(1, 1, 0, "ignored"));
        assert!(uptrace.trace_url(1).is_none());
        uptrace.force_flush().await.unwrap();
        uptrace.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_dsn_disables() {
        let config = Config::default().with_dsn("https://uptrace.dev/1");
        let err = Uptrace::builder(config.clone()).try_build().err().unwrap();
        assert!(matches!(err, ConfigError::InvalidDsn(_)));

        let uptrace = Uptrace::builder(config).build();
        assert!(!uptrace.is_enabled());
    }

    #[tokio::test]
    async fn test_enabled_handle() {
        let config = Config::default()
            .with_dsn("http://token@127.0.0.1:9/1")
            .with_service_name("svc")
            .with_max_concurrent_exports(2);
        let uptrace = Uptrace::builder(config)
            .metric_producer(Vec::<MetricData>::new)
            .try_build()
            .unwrap();

        assert!(uptrace.is_enabled());
        assert_eq!(uptrace.dsn().unwrap().project_id(), "1");
        assert_eq!(
            uptrace.trace_url(0xff).unwrap(),
            "http://127.0.0.1:9/traces/000000000000000000000000000000ff"
        );
        assert!(uptrace.metric_metrics().is_some());

        uptrace.shutdown().await.unwrap();
        assert!(matches!(uptrace.shutdown().await, Err(ProcessorError::Closed)));
    }
}
