//! Batch processor: the async bridge between synchronous producers and
//! gated concurrent exports.
//!
//! Producers call [`BatchProcessor::push`], which only takes a short lock on
//! the [`BatchQueue`]. A single worker task owns the flush policy:
//!
//! - a full batch wakes it through a [`Notify`];
//! - a ticker flushes partial batches every `flush_interval`;
//! - [`BatchProcessor::force_flush`] and [`BatchProcessor::shutdown`] arrive
//!   as commands.
//!
//! Every batch is exported on its own task once a [`Gate`] slot is free.

use crate::batch_processor::{BatchConfig, BatchQueue, ProcessorState, PushOutcome};
use crate::dispatch::{Command, Dispatcher, ExportMetrics};
use crate::exporter::ExporterBoxed;
use crate::gate::Gate;
use crate::span::SpanData;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The worker has stopped; the processor was shut down.
    #[error("processor is shut down")]
    Closed,
    /// The worker task panicked.
    #[error("worker task failed: {0}")]
    Worker(#[from] JoinError),
}

/// Batch processor for finished spans.
pub type BatchSpanProcessor = BatchProcessor<SpanData>;

struct Shared<R> {
    queue: Mutex<BatchQueue<R>>,
    notify: Notify,
}

impl<R> Shared<R> {
    fn queue(&self) -> MutexGuard<'_, BatchQueue<R>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Buffers records and exports them in batches through a shared gate.
pub struct BatchProcessor<R> {
    shared: Arc<Shared<R>>,
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopping: CancellationToken,
    metrics: Arc<ExportMetrics>,
}

impl<R: Send + 'static> BatchProcessor<R> {
    /// Creates the processor and spawns its worker on the current tokio runtime.
    pub fn new(config: BatchConfig, exporter: Arc<dyn ExporterBoxed<R>>, gate: Arc<Gate>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BatchQueue::new(config.clone())),
            notify: Notify::new(),
        });
        let metrics = Arc::new(ExportMetrics::default());
        let (commands, rx) = mpsc::channel(8);
        let stopping = CancellationToken::new();
        let dispatcher = Dispatcher::new(exporter, gate, Arc::clone(&metrics), stopping.clone());

        let worker = tokio::spawn(run_worker(Arc::clone(&shared), rx, dispatcher, config));

        Self {
            shared,
            commands,
            worker: Mutex::new(Some(worker)),
            stopping,
            metrics,
        }
    }

    /// Buffers one record. Never waits for I/O.
    pub fn push(&self, record: R) -> PushOutcome {
        let outcome = self.shared.queue().push(record);
        match outcome {
            PushOutcome::Buffered => {}
            PushOutcome::BatchReady => self.shared.notify.notify_one(),
            PushOutcome::Overflowed => {
                self.metrics.record_dropped(1);
                self.shared.notify.notify_one();
            }
            PushOutcome::Rejected => self.metrics.record_dropped(1),
        }
        outcome
    }

    /// Exports everything pending and waits for in-flight exports.
    pub async fn force_flush(&self) -> Result<(), ProcessorError> {
        let (done, finished) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .await
            .map_err(|_| ProcessorError::Closed)?;
        finished.await.map_err(|_| ProcessorError::Closed)
    }

    /// Stops accepting records, flushes what is pending and waits for
    /// in-flight exports, bounded by `shutdown_timeout`.
    ///
    /// Returns [`ProcessorError::Closed`] when called again.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return Err(ProcessorError::Closed);
        };

        self.shared.queue().begin_shutdown();
        // Unblocks a worker parked on a full gate.
        self.stopping.cancel();
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
        worker.await?;
        Ok(())
    }

    /// Returns export metrics (thread-safe for concurrent exports)
    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.queue().state()
    }

    /// Records waiting for export.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Only complete batches.
    Full,
    /// Everything pending when the flush starts.
    All,
    /// Like `All`, but keeps waiting for gate slots after shutdown was requested.
    Drain,
}

async fn run_worker<R: Send + 'static>(
    shared: Arc<Shared<R>>,
    mut commands: mpsc::Receiver<Command>,
    mut dispatcher: Dispatcher<R>,
    config: BatchConfig,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(result) = dispatcher.join_next(), if !dispatcher.is_idle() => {
                dispatcher.reap(result);
            }

            () = shared.notify.notified() => {
                if flush(&shared, &mut dispatcher, FlushMode::Full).await {
                    ticker.reset();
                }
            }

            _ = ticker.tick() => {
                // The ticker restarts on every handoff, so this is the
                // queue's own interval check.
                let due = shared.queue().should_flush();
                if due && flush(&shared, &mut dispatcher, FlushMode::All).await {
                    ticker.reset();
                }
            }

            command = commands.recv() => match command {
                Some(Command::Flush(done)) => {
                    if flush(&shared, &mut dispatcher, FlushMode::All).await {
                        ticker.reset();
                    }
                    dispatcher.wait_idle_unless_stopping().await;
                    let _ = done.send(());
                }
                Some(Command::Shutdown(done)) => {
                    drain(&shared, &mut dispatcher, &config).await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    // Processor dropped without shutdown.
                    drain(&shared, &mut dispatcher, &config).await;
                    break;
                }
            },
        }
    }
}

/// Hands batches to export tasks, one gate slot per batch. Returns `true`
/// if at least one batch was handed off.
async fn flush<R: Send + 'static>(
    shared: &Shared<R>,
    dispatcher: &mut Dispatcher<R>,
    mode: FlushMode,
) -> bool {
    // Bounded so steady pushes cannot keep an `All` flush going forever.
    let mut budget = shared.queue().len();
    let mut handed_off = false;

    while budget > 0 {
        if mode == FlushMode::Full && !shared.queue().has_full_batch() {
            break;
        }

        let reserved = if mode == FlushMode::Drain {
            dispatcher.reserve().await
        } else {
            match dispatcher.reserve_unless_stopping().await {
                Some(reserved) => reserved,
                None => break,
            }
        };
        let permit = match reserved {
            Ok(permit) => permit,
            Err(err) => {
                tracing::warn!(error = %err, pending = shared.queue().len(), "cannot export pending records");
                break;
            }
        };

        let Some(batch) = shared.queue().take_batch() else {
            break;
        };
        budget = budget.saturating_sub(batch.len());
        dispatcher.spawn(permit, batch);
        shared.queue().finish_handoff();
        handed_off = true;
    }
    handed_off
}

/// Shutdown path: flush, then wait for exports until `shutdown_timeout`.
async fn drain<R: Send + 'static>(
    shared: &Shared<R>,
    dispatcher: &mut Dispatcher<R>,
    config: &BatchConfig,
) {
    shared.queue().begin_shutdown();
    let deadline = Instant::now() + config.shutdown_timeout;

    if tokio::time::timeout_at(deadline, flush(shared, dispatcher, FlushMode::Drain))
        .await
        .is_err()
    {
        tracing::warn!("shutdown timeout elapsed before all records were handed off");
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    dispatcher.drain_within(remaining).await;

    let mut queue = shared.queue();
    let left = queue.len() as u64;
    queue.close();
    dispatcher.metrics().record_dropped(left);
}
