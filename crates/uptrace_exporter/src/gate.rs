//! Counting gate that bounds concurrent export tasks.
//!
//! The gate is a fixed-capacity semaphore that also tracks how many slots are
//! held, so a release without a matching acquire is detected instead of
//! silently raising the capacity.

use crate::invariants::debug_assert_gate_bounded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// Every slot is held.
    #[error("gate is full")]
    Full,
    /// The gate was closed; no further slots are handed out.
    #[error("gate is closed")]
    Closed,
}

/// Fixed-capacity admission gate.
#[derive(Debug)]
pub struct Gate {
    semaphore: Semaphore,
    capacity: usize,
    held: AtomicUsize,
}

impl Gate {
    /// Creates a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            held: AtomicUsize::new(0),
        }
    }

    /// Creates a gate sized to the available parallelism of the machine.
    pub fn with_available_parallelism() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Closed`] once [`Gate::close`] was called.
    pub async fn acquire(&self) -> Result<(), GateError> {
        let permit = self.semaphore.acquire().await.map_err(|_| GateError::Closed)?;
        permit.forget();
        self.take_slot();
        Ok(())
    }

    /// Takes a free slot without waiting.
    pub fn try_acquire(&self) -> Result<(), GateError> {
        let permit = self.semaphore.try_acquire().map_err(|err| match err {
            TryAcquireError::NoPermits => GateError::Full,
            TryAcquireError::Closed => GateError::Closed,
        })?;
        permit.forget();
        self.take_slot();
        Ok(())
    }

    /// Returns a slot taken by [`Gate::acquire`] or [`Gate::try_acquire`].
    ///
    /// # Panics
    ///
    /// Panics when no slot is held.
    pub fn release(&self) {
        let released = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1));
        if released.is_err() {
            panic!(
                "gate released without a matching acquire (capacity {})",
                self.capacity
            );
        }
        self.semaphore.add_permits(1);
    }

    /// Waits for a slot and wraps it in a guard that releases on drop.
    pub async fn enter(self: &Arc<Self>) -> Result<GatePermit, GateError> {
        self.acquire().await?;
        Ok(GatePermit {
            gate: Arc::clone(self),
        })
    }

    /// Non-blocking variant of [`Gate::enter`].
    pub fn try_enter(self: &Arc<Self>) -> Result<GatePermit, GateError> {
        self.try_acquire()?;
        Ok(GatePermit {
            gate: Arc::clone(self),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stops handing out slots. Held slots may still be released.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn take_slot(&self) {
        let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_gate_bounded!(held, self.capacity);
    }
}

/// A held gate slot; dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
