//! Wall-clock adapter.
//!
//! Bucket timestamps and blacklist stamps are compared across processes, so
//! the production clock reads `SystemTime`. Hosts sharing a store should run
//! NTP; skew that puts a stored `last_refill` ahead of a reader's clock is
//! treated as zero elapsed time.
//!
//! Tests use `MockClock` from `crate::infrastructure::mocks` (enabled by the
//! `test-helpers` feature).

use crate::application::ports::Clock;
use std::time::SystemTime;

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
