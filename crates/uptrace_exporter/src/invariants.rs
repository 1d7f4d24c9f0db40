//! Debug assertion macros for pipeline invariants.
//!
//! These macros are only active in debug builds (`#[cfg(debug_assertions)]`),
//! so there is zero overhead in release builds. Invariants whose violation
//! would corrupt shared state (gate over-release) are checked unconditionally
//! at the call site instead.

// =============================================================================
// Gate: bounded in-flight count
// =============================================================================

/// Assert that the number of held gate slots never exceeds capacity.
///
/// **Invariant**: `0 ≤ in_use ≤ capacity`
///
/// Used in: `Gate::acquire()` and `Gate::try_acquire()` after taking a slot
macro_rules! debug_assert_gate_bounded {
    ($in_use:expr, $capacity:expr) => {
        debug_assert!(
            $in_use <= $capacity,
            "gate invariant violated: {} slots held but capacity is {}",
            $in_use,
            $capacity
        )
    };
}

// =============================================================================
// Retry: capped exponential backoff
// =============================================================================

/// Assert that a computed backoff delay respects the configured maximum.
///
/// **Invariant**: `delay_for_attempt(n) ≤ max_delay`
///
/// Used in: `DeliveryClient::post()` before sleeping
macro_rules! debug_assert_backoff_capped {
    ($delay:expr, $max:expr) => {
        debug_assert!(
            $delay <= $max,
            "backoff invariant violated: delay {:?} exceeds max_delay {:?}",
            $delay,
            $max
        )
    };
}

// =============================================================================
// Encoder pool: reset before reuse
// =============================================================================

/// Assert that an encoder handed out by the pool carries no bytes from a
/// previous payload.
///
/// **Invariant**: `release(e) → next acquire() observes e.is_reset()`
///
/// Used in: `EncoderPool::acquire()`
macro_rules! debug_assert_encoder_reset {
    ($encoder:expr) => {
        debug_assert!(
            $encoder.is_reset(),
            "encoder pool invariant violated: pooled encoder holds leftover bytes"
        )
    };
}

// =============================================================================
// Transform: histogram bucket alignment
// =============================================================================

/// Assert that histogram bucket counts line up with the boundaries.
///
/// **Invariant**: `counts.len() == bounds.len() + 1`
///
/// Used in: `transform::metric_to_wire()` after normalizing buckets
macro_rules! debug_assert_buckets_aligned {
    ($bounds:expr, $counts:expr) => {
        debug_assert!(
            $counts.len() == $bounds.len() + 1,
            "histogram invariant violated: {} counts for {} bounds",
            $counts.len(),
            $bounds.len()
        )
    };
}

pub(crate) use debug_assert_backoff_capped;
pub(crate) use debug_assert_buckets_aligned;
pub(crate) use debug_assert_encoder_reset;
pub(crate) use debug_assert_gate_bounded;
