// src/core/clock.rs

//! The per-node monotonic registration clock.
//!
//! Registration times are tiebreakers: a node must never hand out the same
//! or a smaller timestamp twice, and a conflict winner must be able to stamp
//! an entry with a time greater than a timestamp drawn from *another* node's
//! clock. A raw system clock guarantees neither, so the clock keeps an
//! atomic high-water mark over system time in nanoseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Helper to get the current system time in nanoseconds since the UNIX epoch.
fn system_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// A strictly-increasing nanosecond clock, one per node.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp strictly greater than every timestamp previously
    /// returned by this clock.
    pub fn now(&self) -> u64 {
        self.now_after(0)
    }

    /// Returns a timestamp strictly greater than both `floor` and every
    /// timestamp previously returned by this clock. Used when re-stamping a
    /// conflict winner, where `floor` comes from a remote clock.
    pub fn now_after(&self, floor: u64) -> u64 {
        let wall = system_now_ns();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1).max(floor + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}
