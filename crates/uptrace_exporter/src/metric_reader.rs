//! Periodic metric reader.
//!
//! Every `interval` the reader pulls aggregations from a [`MetricProducer`],
//! splits them into batches and exports each batch through the shared gate.

use crate::batch_processor::Batch;
use crate::dispatch::{Command, Dispatcher, ExportMetrics};
use crate::exporter::ExporterBoxed;
use crate::gate::Gate;
use crate::metric::MetricData;
use crate::processor::ProcessorError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Collection hook of the instrumentation API.
pub trait MetricProducer: Send + Sync + 'static {
    /// Returns the current aggregations, one per instrument and attribute set.
    fn collect(&self) -> Vec<MetricData>;
}

impl<F> MetricProducer for F
where
    F: Fn() -> Vec<MetricData> + Send + Sync + 'static,
{
    fn collect(&self) -> Vec<MetricData> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Time between collections
    pub interval: Duration,
    /// Maximum number of records per exported batch
    pub max_batch_size: usize,
    /// Upper bound on waiting for in-flight exports at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_batch_size: 1000,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ReaderConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Collects metrics on a fixed interval and exports them.
pub struct PeriodicReader {
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopping: CancellationToken,
    metrics: Arc<ExportMetrics>,
}

impl PeriodicReader {
    /// Creates the reader and spawns its worker on the current tokio runtime.
    pub fn new(
        config: ReaderConfig,
        producer: Arc<dyn MetricProducer>,
        exporter: Arc<dyn ExporterBoxed<MetricData>>,
        gate: Arc<Gate>,
    ) -> Self {
        let metrics = Arc::new(ExportMetrics::default());
        let (commands, rx) = mpsc::channel(8);
        let stopping = CancellationToken::new();
        let dispatcher = Dispatcher::new(exporter, gate, Arc::clone(&metrics), stopping.clone());
        let worker = tokio::spawn(run_reader(producer, rx, dispatcher, config));

        Self {
            commands,
            worker: Mutex::new(Some(worker)),
            stopping,
            metrics,
        }
    }

    /// Collects and exports now, then waits for in-flight exports.
    pub async fn force_flush(&self) -> Result<(), ProcessorError> {
        let (done, finished) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .await
            .map_err(|_| ProcessorError::Closed)?;
        finished.await.map_err(|_| ProcessorError::Closed)
    }

    /// Final collection, then waits for exports bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return Err(ProcessorError::Closed);
        };

        self.stopping.cancel();
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
        worker.await?;
        Ok(())
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.metrics
    }
}

async fn run_reader(
    producer: Arc<dyn MetricProducer>,
    mut commands: mpsc::Receiver<Command>,
    mut dispatcher: Dispatcher<MetricData>,
    config: ReaderConfig,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq = 0;

    loop {
        tokio::select! {
            Some(result) = dispatcher.join_next(), if !dispatcher.is_idle() => {
                dispatcher.reap(result);
            }

            _ = ticker.tick() => {
                collect_and_export(producer.as_ref(), &mut dispatcher, &config, &mut seq, false).await;
            }

            command = commands.recv() => match command {
                Some(Command::Flush(done)) => {
                    collect_and_export(producer.as_ref(), &mut dispatcher, &config, &mut seq, false).await;
                    dispatcher.wait_idle_unless_stopping().await;
                    let _ = done.send(());
                }
                Some(Command::Shutdown(done)) => {
                    shutdown(producer.as_ref(), &mut dispatcher, &config, &mut seq).await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    shutdown(producer.as_ref(), &mut dispatcher, &config, &mut seq).await;
                    break;
                }
            },
        }
    }
}

async fn collect_and_export(
    producer: &dyn MetricProducer,
    dispatcher: &mut Dispatcher<MetricData>,
    config: &ReaderConfig,
    seq: &mut u64,
    draining: bool,
) {
    let mut records = producer.collect();
    if records.is_empty() {
        return;
    }
    tracing::trace!(records = records.len(), "collected metrics");

    let batch_size = config.max_batch_size.max(1);
    while !records.is_empty() {
        let rest = records.split_off(records.len().min(batch_size));
        let chunk = std::mem::replace(&mut records, rest);

        let reserved = if draining {
            dispatcher.reserve().await
        } else {
            match dispatcher.reserve_unless_stopping().await {
                Some(reserved) => reserved,
                None => {
                    // Superseded by the final collection at shutdown.
                    let skipped = (chunk.len() + records.len()) as u64;
                    tracing::debug!(records = skipped, "shutdown requested, skipping collected metrics");
                    dispatcher.metrics().record_dropped(skipped);
                    return;
                }
            }
        };
        let permit = match reserved {
            Ok(permit) => permit,
            Err(err) => {
                let lost = (chunk.len() + records.len()) as u64;
                tracing::warn!(error = %err, records = lost, "cannot export metrics");
                dispatcher.metrics().record_dropped(lost);
                return;
            }
        };
        *seq += 1;
        dispatcher.spawn(
            permit,
            Batch {
                seq: *seq,
                records: chunk,
            },
        );
    }
}

async fn shutdown(
    producer: &dyn MetricProducer,
    dispatcher: &mut Dispatcher<MetricData>,
    config: &ReaderConfig,
    seq: &mut u64,
) {
    let deadline = Instant::now() + config.shutdown_timeout;
    if tokio::time::timeout_at(
        deadline,
        collect_and_export(producer, dispatcher, config, seq, true),
    )
    .await
    .is_err()
    {
        tracing::warn!("shutdown timeout elapsed during final metric collection");
    }
    dispatcher
        .drain_within(deadline.saturating_duration_since(Instant::now()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::testing::TestExporter;
    use crate::metric::{Aggregation, Descriptor, InstrumentKind, Number};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counter(n: u64) -> MetricData {
        MetricData::new(
            Descriptor::new(format!("counter.{n}"), InstrumentKind::Counter),
            Aggregation::Sum(Number::U64(n)),
            n,
        )
    }

    struct CountingProducer {
        calls: AtomicU64,
        per_call: u64,
    }

    impl MetricProducer for CountingProducer {
        fn collect(&self) -> Vec<MetricData> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (0..self.per_call).map(counter).collect()
        }
    }

    #[tokio::test]
    async fn test_force_flush_splits_batches() {
        let exporter = Arc::new(TestExporter::<MetricData>::new());
        let producer = Arc::new(CountingProducer {
            calls: AtomicU64::new(0),
            per_call: 7,
        });
        let reader = PeriodicReader::new(
            ReaderConfig::default().with_max_batch_size(3),
            producer.clone(),
            exporter.clone(),
            Arc::new(Gate::new(2)),
        );

        reader.force_flush().await.unwrap();

        let mut sizes = exporter.batch_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3, 3]);
        assert_eq!(reader.metrics().records_exported(), 7);
        assert_eq!(producer.calls.load(Ordering::Relaxed), 1);
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_collects_on_interval() {
        let exporter = Arc::new(TestExporter::<MetricData>::new());
        let reader = PeriodicReader::new(
            ReaderConfig::default().with_interval(Duration::from_millis(50)),
            Arc::new(|| vec![counter(1)]),
            exporter.clone(),
            Arc::new(Gate::new(1)),
        );

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(exporter.exported_count() >= 2);
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_bounded_while_gate_is_full() {
        let exporter = Arc::new(TestExporter::<MetricData>::with_delay(Duration::from_secs(3)));
        let reader = Arc::new(PeriodicReader::new(
            ReaderConfig::default()
                .with_max_batch_size(1)
                .with_shutdown_timeout(Duration::from_millis(100)),
            Arc::new(|| vec![counter(1), counter(2)]),
            exporter.clone(),
            Arc::new(Gate::new(1)),
        ));

        let flushing = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.force_flush().await })
        };
        // One export holds the only slot; the second batch waits for the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        reader.shutdown().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(flushing.await.unwrap().is_ok());
        assert_eq!(exporter.exported_count(), 0);
        assert_eq!(reader.metrics().records_exported(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_collection() {
        let exporter = Arc::new(TestExporter::<MetricData>::new());
        let producer = Arc::new(CountingProducer {
            calls: AtomicU64::new(0),
            per_call: 2,
        });
        let reader = PeriodicReader::new(
            ReaderConfig::default(),
            producer.clone(),
            exporter.clone(),
            Arc::new(Gate::new(1)),
        );

        reader.shutdown().await.unwrap();
        assert_eq!(producer.calls.load(Ordering::Relaxed), 1);
        assert_eq!(exporter.exported_count(), 2);
        assert!(matches!(reader.shutdown().await, Err(ProcessorError::Closed)));
    }
}
