//! Gated concurrent export tasks shared by the span processor and the
//! metric reader.

use crate::batch_processor::Batch;
use crate::exporter::ExporterBoxed;
use crate::gate::{Gate, GateError, GatePermit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Thread-safe counters for concurrent exports
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Records delivered successfully
    pub records_exported: AtomicU64,
    /// Batches delivered successfully
    pub batches_exported: AtomicU64,
    /// Batches that failed to encode or deliver
    pub export_errors: AtomicU64,
    /// Records lost to overflow, failed exports, or shutdown
    pub records_dropped: AtomicU64,
    /// Export tasks currently running
    pub inflight_exports: AtomicU64,
}

impl ExportMetrics {
    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    pub(crate) fn record_success(&self, records: u64) {
        self.records_exported.fetch_add(records, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, records: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.record_dropped(records);
    }

    pub(crate) fn record_dropped(&self, records: u64) {
        if records > 0 {
            self.records_dropped.fetch_add(records, Ordering::Relaxed);
        }
    }
}

/// Control messages for a pipeline worker. The sender is notified once the
/// command completed.
#[derive(Debug)]
pub(crate) enum Command {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Tracks one running export. Dropping it without [`InflightGuard::finish`]
/// (task aborted) counts the batch as dropped.
struct InflightGuard {
    metrics: Arc<ExportMetrics>,
    records: u64,
    finished: bool,
}

impl InflightGuard {
    fn new(metrics: Arc<ExportMetrics>, records: u64) -> Self {
        metrics.inflight_exports.fetch_add(1, Ordering::Relaxed);
        Self {
            metrics,
            records,
            finished: false,
        }
    }

    fn finish(mut self, ok: bool) {
        if ok {
            self.metrics.record_success(self.records);
        } else {
            self.metrics.record_error(self.records);
        }
        self.finished = true;
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight_exports.fetch_sub(1, Ordering::Relaxed);
        if !self.finished {
            self.metrics.record_dropped(self.records);
        }
    }
}

/// Spawns gated export tasks and tracks them until they finish.
pub(crate) struct Dispatcher<R> {
    exporter: Arc<dyn ExporterBoxed<R>>,
    gate: Arc<Gate>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    stopping: CancellationToken,
    metrics: Arc<ExportMetrics>,
}

impl<R: Send + 'static> Dispatcher<R> {
    /// `stopping` is fired by the owning handle when shutdown is requested.
    pub(crate) fn new(
        exporter: Arc<dyn ExporterBoxed<R>>,
        gate: Arc<Gate>,
        metrics: Arc<ExportMetrics>,
        stopping: CancellationToken,
    ) -> Self {
        Self {
            exporter,
            gate,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            stopping,
            metrics,
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.metrics
    }

    /// Waits for a gate slot for the next export.
    pub(crate) async fn reserve(&self) -> Result<GatePermit, GateError> {
        self.gate.enter().await
    }

    /// Like [`Dispatcher::reserve`], but returns `None` once shutdown was
    /// requested so the worker can move on to its bounded drain.
    pub(crate) async fn reserve_unless_stopping(&self) -> Option<Result<GatePermit, GateError>> {
        tokio::select! {
            biased;
            () = self.stopping.cancelled() => None,
            reserved = self.reserve() => Some(reserved),
        }
    }

    /// Spawns the export of `batch`. The permit is released when the task ends.
    pub(crate) fn spawn(&mut self, permit: GatePermit, batch: Batch<R>) {
        let exporter = Arc::clone(&self.exporter);
        let cancel = self.cancel.clone();
        let guard = InflightGuard::new(Arc::clone(&self.metrics), batch.len() as u64);
        let seq = batch.seq;

        self.tasks.spawn(async move {
            let _permit = permit;
            match exporter.export_boxed(batch, cancel).await {
                Ok(()) => guard.finish(true),
                Err(err) => {
                    tracing::warn!(
                        exporter = exporter.name(),
                        seq,
                        records = guard.records,
                        error = %err,
                        "export failed, batch dropped"
                    );
                    guard.finish(false);
                }
            }
        });
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next finished export task; pending forever when none is running.
    pub(crate) async fn join_next(&mut self) -> Option<Result<(), JoinError>> {
        self.tasks.join_next().await
    }

    pub(crate) fn reap(&self, result: Result<(), JoinError>) {
        if let Err(err) = result {
            if err.is_panic() {
                tracing::error!(exporter = self.exporter.name(), error = %err, "export task panicked");
            }
        }
    }

    /// Waits until every running export finished.
    pub(crate) async fn wait_idle(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            self.reap(result);
        }
    }

    /// Waits until every running export finished or shutdown was requested.
    pub(crate) async fn wait_idle_unless_stopping(&mut self) {
        let stopping = self.stopping.clone();
        tokio::select! {
            () = self.wait_idle() => {}
            () = stopping.cancelled() => {}
        }
    }

    /// Waits for running exports up to `timeout`, then cancels and aborts the
    /// rest. Returns `true` if everything finished in time.
    pub(crate) async fn drain_within(&mut self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            return true;
        }

        tracing::warn!(
            exporter = self.exporter.name(),
            remaining = self.tasks.len(),
            "shutdown timeout elapsed, aborting in-flight exports"
        );
        self.cancel.cancel();
        self.tasks.abort_all();
        self.wait_idle().await;
        false
    }
}
