//! Monotonic millisecond clock for the instance.
//!
//! Anchored on a [`tokio::time::Instant`] captured at construction, so paused
//! test runtimes can drive delayed-request timers deterministically.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy)]
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Milliseconds elapsed since the instance was created.
    pub(crate) fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// The deadline corresponding to a `now()`-relative millisecond stamp.
    pub(crate) fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }
}
