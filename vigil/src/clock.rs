//! Monotonic time sources.
//!
//! ## Usage
//!
//! Every window in the engine (deduplication, breaker cool-down, recovery
//! budget, pattern recency) is measured in nanoseconds read from a [`Clock`].
//! Production code uses [`MonotonicClock`]; tests and replay tools drive a
//! [`ManualClock`] instead.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// A monotonic nanosecond time source.
pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds elapsed since an arbitrary, fixed origin.
    fn now_nanos(&self) -> u64;
}

/// Clock backed by [`Instant`], with its origin at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        // Saturates after ~584 years of uptime.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at `start_nanos`.
    pub fn new(start_nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(start_nanos),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(duration_nanos(delta), Ordering::AcqRel);
    }

    /// Sets the absolute clock value. Callers must not move it backwards.
    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Converts a [`Duration`] to whole nanoseconds, saturating at `u64::MAX`.
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Nanoseconds elapsed from `earlier` to `now`, zero if the clock was reset.
pub(crate) fn elapsed_since(now: u64, earlier: u64) -> u64 {
    now.saturating_sub(earlier)
}
