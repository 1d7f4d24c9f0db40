//! Batch Queue - Pure Batching Abstraction
//!
//! [`BatchQueue`] accumulates records and decides when a batch is due. It has
//! no concurrency of its own: no `Arc`, no atomics, no exporter. The
//! [`BatchProcessor`](crate::processor::BatchProcessor) wraps it in a mutex
//! and owns the worker task that ships the batches it hands out.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──push──▶ Accumulating ──take_batch──▶ Flushing ──finish_handoff──▶ Accumulating | Idle
//!   │                 │                          │
//!   └─────────────────┴──── begin_shutdown ──────┴──▶ ShuttingDown ──close──▶ Closed
//! ```
//!
//! # Overflow
//!
//! The queue never holds more than `max_queue_size` records. When it is full
//! the oldest record is dropped to admit the newest one, and the drop is
//! counted.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum number of records per exported batch
    pub max_batch_size: usize,
    /// Maximum number of records buffered while waiting for export
    pub max_queue_size: usize,
    /// Maximum time a record waits before its batch is flushed
    pub flush_interval: Duration,
    /// Upper bound on waiting for in-flight exports at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_queue_size: 10_000,
            flush_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// State of the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Nothing buffered.
    Idle,
    /// Records buffered, no batch due yet.
    Accumulating,
    /// A batch was taken and is being handed to an export task.
    Flushing,
    /// No new records accepted; pending ones are being drained.
    ShuttingDown,
    /// Terminal.
    Closed,
}

/// What happened to a pushed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered; no batch due yet.
    Buffered,
    /// Buffered; a full batch is now available.
    BatchReady,
    /// Buffered after dropping the oldest record.
    Overflowed,
    /// Not buffered; the queue is shutting down or closed.
    Rejected,
}

/// A batch moved out of the queue. The queue never touches it again.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<R> {
    /// Monotonic batch number, starting at 1
    pub seq: u64,
    pub records: Vec<R>,
}

impl<R> Batch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Bounded FIFO accumulator with a size/time flush policy.
#[derive(Debug)]
pub struct BatchQueue<R> {
    pending: VecDeque<R>,
    config: BatchConfig,
    state: ProcessorState,
    dropped: u64,
    next_seq: u64,
    last_flush: Instant,
}

impl<R> BatchQueue<R> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(config.max_batch_size.min(config.max_queue_size)),
            config,
            state: ProcessorState::Idle,
            dropped: 0,
            next_seq: 1,
            last_flush: Instant::now(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Appends a record, dropping the oldest one if the queue is full.
    pub fn push(&mut self, record: R) -> PushOutcome {
        match self.state {
            ProcessorState::ShuttingDown | ProcessorState::Closed => return PushOutcome::Rejected,
            ProcessorState::Idle => self.state = ProcessorState::Accumulating,
            ProcessorState::Accumulating | ProcessorState::Flushing => {}
        }

        let overflowed = if self.pending.len() >= self.config.max_queue_size.max(1) {
            self.pending.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.pending.push_back(record);

        if overflowed {
            PushOutcome::Overflowed
        } else if self.pending.len() >= self.config.max_batch_size {
            PushOutcome::BatchReady
        } else {
            PushOutcome::Buffered
        }
    }

    /// Returns the number of pending records
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// A full batch is pending.
    pub fn has_full_batch(&self) -> bool {
        self.pending.len() >= self.config.max_batch_size
    }

    /// Checks if a batch is due: a full batch is pending, or records have
    /// waited for at least `flush_interval`.
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.has_full_batch() || self.last_flush.elapsed() >= self.config.flush_interval)
    }

    /// Moves up to `max_batch_size` of the oldest records into a batch.
    ///
    /// Returns `None` if nothing is pending.
    pub fn take_batch(&mut self) -> Option<Batch<R>> {
        if self.pending.is_empty() {
            return None;
        }

        let n = self.pending.len().min(self.config.max_batch_size.max(1));
        let records: Vec<R> = self.pending.drain(..n).collect();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.last_flush = Instant::now();
        if matches!(
            self.state,
            ProcessorState::Idle | ProcessorState::Accumulating
        ) {
            self.state = ProcessorState::Flushing;
        }
        Some(Batch { seq, records })
    }

    /// Marks the last taken batch as handed off.
    pub fn finish_handoff(&mut self) {
        if self.state == ProcessorState::Flushing {
            self.state = if self.pending.is_empty() {
                ProcessorState::Idle
            } else {
                ProcessorState::Accumulating
            };
        }
    }

    /// Stops accepting records. Pending ones can still be taken.
    pub fn begin_shutdown(&mut self) {
        if self.state != ProcessorState::Closed {
            self.state = ProcessorState::ShuttingDown;
        }
    }

    /// Terminal transition; anything still pending is discarded and counted as dropped.
    pub fn close(&mut self) {
        self.dropped += self.pending.len() as u64;
        self.pending.clear();
        self.state = ProcessorState::Closed;
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Records dropped by overflow or by closing with records pending.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
