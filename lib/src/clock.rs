//! Monotonic clock access.
//!
//! Every function is safe to call from any context. Before the embedding
//! kernel registers a [`collab::MonotonicClock`](crate::collab::MonotonicClock),
//! every accessor returns `0`.

use crate::collab;

/// Returns the monotonic clock value in nanoseconds since some fixed but
/// arbitrary epoch (boot, typically). Returns `0` if no clock has been
/// registered yet.
#[inline]
pub fn monotonic_ns() -> u64 {
    collab::monotonic_clock().map_or(0, |c| c.now_ns())
}

/// Convenience wrapper around [`monotonic_ns`] with millisecond granularity.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_ns() / 1_000_000
}
