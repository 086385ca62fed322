//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mock clock for testing.
///
/// Allows tests to control time progression explicitly, enabling deterministic
/// testing of token refill and TTL expiry.
///
/// # Examples
///
/// ```
/// use resilience_guard::infrastructure::mocks::MockClock;
/// use resilience_guard::application::ports::Clock;
/// use std::time::Duration;
///
/// let clock = MockClock::at_unix(1_700_000_000);
/// assert_eq!(clock.unix_seconds(), 1_700_000_000.0);
///
/// clock.advance(Duration::from_secs(61));
/// assert_eq!(clock.unix_seconds(), 1_700_000_061.0);
/// ```
///
/// # Thread Safety
///
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones (and every store or service holding one).
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<SystemTime>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific time.
    pub fn new(start: SystemTime) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock starting at whole unix seconds.
    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time += duration;
    }

    /// Set the clock to a specific time.
    pub fn set(&self, time: SystemTime) {
        let mut current = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *current = time;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::at_unix(100);
        assert_eq!(clock.unix_seconds(), 100.0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.unix_seconds(), 110.0);

        clock.set(UNIX_EPOCH + Duration::from_secs(500));
        assert_eq!(clock.unix_seconds(), 500.0);
    }

    #[test]
    fn test_clones_share_time() {
        let clock = MockClock::at_unix(0);
        let other = clock.clone();
        let handle = std::thread::spawn(move || other.advance(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(clock.unix_seconds(), 5.0);
    }
}
