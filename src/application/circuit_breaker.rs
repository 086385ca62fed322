//! Circuit breaker guarding calls to the shared store.
//!
//! When the store keeps failing, the breaker opens and callers stop waiting on
//! it: admission checks fail open immediately until the recovery timeout has
//! elapsed. Then exactly one trial call is let through (half-open) while every
//! other caller keeps failing open. The trial's outcome closes or reopens the
//! circuit. A trial that never reports back is replaced after another recovery
//! timeout.
//!
//! This breaker protects the limiter's store round trips. It is unrelated to
//! [`RecoveryEngine::activate_circuit_breaker`], which is a hard-fail fallback
//! for wrapped operations.
//!
//! [`RecoveryEngine::activate_circuit_breaker`]: crate::application::recovery::RecoveryEngine::activate_circuit_breaker

use crate::application::ports::Clock;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls flow normally
    Closed = 0,
    /// Store assumed down; calls are skipped
    Open = 1,
    /// One trial call is in flight to test recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Seconds to wait before a trial call, and before replacing an
    /// unanswered one
    pub recovery_timeout_secs: u64,
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
        }
    }
}

/// Lock-free circuit breaker driven by the [`Clock`] port.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_unix_nanos: AtomicU64,
    /// Start of the in-flight trial call, 0 when none
    trial_started_unix_nanos: AtomicU64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker with custom configuration.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_unix_nanos: AtomicU64::new(0),
            trial_started_unix_nanos: AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Check if a store call should be attempted.
    ///
    /// Returns `false` while the circuit is open and the recovery timeout has
    /// not yet elapsed, and while half-open for everyone but the trial call.
    /// A caller that gets `true` must report back through
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.try_start_trial(),
            CircuitState::Open => {
                let since_failure = self
                    .now_nanos()
                    .saturating_sub(self.last_failure_unix_nanos.load(Ordering::Acquire));

                if Duration::from_nanos(since_failure) < self.config.recovery_timeout() {
                    return false;
                }
                if !self.try_start_trial() {
                    return false;
                }
                self.transition(CircuitState::Open, CircuitState::HalfOpen);
                true
            }
        }
    }

    /// Record a successful store call. A successful trial call closes the
    /// circuit.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_started_unix_nanos.store(0, Ordering::Release);
        if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
            info!("Store circuit closed after successful trial call");
        }
    }

    /// Record a failed store call.
    ///
    /// Opens the circuit once `failure_threshold` consecutive failures have
    /// been seen, or immediately when the trial call fails.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_unix_nanos
            .store(self.now_nanos(), Ordering::Release);

        if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
            self.trial_started_unix_nanos.store(0, Ordering::Release);
            warn!(failures, "Store trial call failed, circuit reopened");
        } else if failures >= u64::from(self.config.failure_threshold)
            && self.transition(CircuitState::Closed, CircuitState::Open)
        {
            self.trial_started_unix_nanos.store(0, Ordering::Release);
            warn!(
                failures,
                recovery_timeout_secs = self.config.recovery_timeout_secs,
                "Store circuit opened"
            );
        }
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_started_unix_nanos.store(0, Ordering::Release);
    }

    /// Claim the trial slot. Fails while another trial started less than a
    /// recovery timeout ago.
    fn try_start_trial(&self) -> bool {
        let now = self.now_nanos().max(1);
        let started = self.trial_started_unix_nanos.load(Ordering::Acquire);
        if started != 0
            && Duration::from_nanos(now.saturating_sub(started)) < self.config.recovery_timeout()
        {
            return false;
        }
        self.trial_started_unix_nanos
            .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn now_nanos(&self) -> u64 {
        self.clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().try_into().unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::thread;

    fn breaker(threshold: u32, recovery_secs: u64) -> (CircuitBreaker, MockClock) {
        let clock = MockClock::at_unix(1_700_000_000);
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
        };
        (CircuitBreaker::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_initial_state() {
        let (cb, _) = breaker(5, 30);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_failure_threshold() {
        let (cb, _) = breaker(3, 1);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failures() {
        let (cb, _) = breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recovery_to_half_open_then_closed() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        assert!(!cb.allow_request());

        clock.advance(Duration::from_secs(9));
        assert!(!cb.allow_request());

        clock.advance(Duration::from_secs(1));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_half_open_admits_one_trial_call() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));

        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        for _ in 0..5 {
            assert!(!cb.allow_request());
        }

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
    }

    #[test]
    fn test_unanswered_trial_is_replaced_after_timeout() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_request());

        clock.advance(Duration::from_secs(9));
        assert!(!cb.allow_request());

        clock.advance(Duration::from_secs(1));
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_concurrent_callers_get_one_trial() {
        let (cb, clock) = breaker(1, 10);
        cb.record_failure();
        clock.advance(Duration::from_secs(10));

        let cb = Arc::new(cb);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || (0..10).filter(|_| cb.allow_request()).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_reset() {
        let (cb, _) = breaker(1, 60);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let (cb, _) = breaker(50, 60);
        let cb = Arc::new(cb);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cb.consecutive_failures(), 100);
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
