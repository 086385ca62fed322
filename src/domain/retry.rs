//! Retry profiles and backoff arithmetic.
//!
//! A [`RetryPolicy`] is an immutable value built once at startup. The engine
//! never constructs policies per call.

use crate::domain::error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which retry profile governs a wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryProfile {
    /// Retries transient failures with exponential backoff.
    Generic,
    /// Delays the first attempt, then retries only overload signals.
    Backpressure,
    /// Resubscribes continuous operations on stream faults; truncates on exhaustion.
    Streaming,
}

impl fmt::Display for RetryProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryProfile::Generic => "generic",
            RetryProfile::Backpressure => "backpressure",
            RetryProfile::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Error returned when a retry policy is nonsensical.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    /// At least one attempt is required
    #[error("max_attempts must be greater than 0")]
    ZeroAttempts,
    /// Jitter must be a fraction of the delay
    #[error("jitter_fraction must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),
    /// The backoff ceiling is below its starting point
    #[error("initial_delay {initial:?} exceeds max_delay {max:?}")]
    DelayOrder {
        /// Configured initial delay
        initial: Duration,
        /// Configured maximum delay
        max: Duration,
    },
}

/// Retry parameters for one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Jitter band as a fraction of the computed delay
    pub jitter_fraction: f64,
    /// Fixed delay before the first attempt (load shedding)
    pub pre_delay: Duration,
    retryable: Vec<ErrorClass>,
}

impl RetryPolicy {
    /// Build a policy that retries the given error classes.
    ///
    /// # Errors
    /// Returns a [`RetryPolicyError`] if the parameters are inconsistent.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        jitter_fraction: f64,
        retryable: impl IntoIterator<Item = ErrorClass>,
    ) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !(0.0..=1.0).contains(&jitter_fraction) {
            return Err(RetryPolicyError::JitterOutOfRange(jitter_fraction));
        }
        if initial_delay > max_delay {
            return Err(RetryPolicyError::DelayOrder {
                initial: initial_delay,
                max: max_delay,
            });
        }

        let retryable = retryable
            .into_iter()
            .filter(|class| !matches!(class, ErrorClass::Validation | ErrorClass::CircuitOpen))
            .collect();

        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            jitter_fraction,
            pre_delay: Duration::ZERO,
            retryable,
        })
    }

    /// Set a fixed delay imposed before the first attempt.
    pub fn with_pre_delay(mut self, pre_delay: Duration) -> Self {
        self.pre_delay = pre_delay;
        self
    }

    /// Default generic policy: 3 attempts, 100ms doubling to 2s, ±50% jitter.
    pub fn generic() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_fraction: 0.5,
            pre_delay: Duration::ZERO,
            retryable: vec![ErrorClass::Transient, ErrorClass::StoreUnavailable],
        }
    }

    /// Default backpressure policy: 100ms pre-delay, 5 attempts, 200ms doubling to 5s.
    pub fn backpressure() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.25,
            pre_delay: Duration::from_millis(100),
            retryable: vec![ErrorClass::Backpressure],
        }
    }

    /// Default streaming policy: 3 attempts, 500ms doubling to 10s.
    pub fn streaming() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.2,
            pre_delay: Duration::ZERO,
            retryable: vec![ErrorClass::Streaming],
        }
    }

    /// Check whether failures of this class are retried.
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        self.retryable.contains(&class)
    }

    /// Error classes this policy retries.
    pub fn retryable_classes(&self) -> &[ErrorClass] {
        &self.retryable
    }

    /// Un-jittered delay before retry `retry_index` (zero-based).
    ///
    /// `min(max_delay, initial_delay * 2^retry_index)`
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_index).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry `retry_index`, with jitter applied.
    ///
    /// `unit` is a sample from `[-1, 1]`; the result is
    /// `base * (1 + unit * jitter_fraction)`.
    pub fn jittered_delay(&self, retry_index: u32, unit: f64) -> Duration {
        let base = self.base_delay(retry_index).as_secs_f64();
        let unit = unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base * (1.0 + unit * self.jitter_fraction)).max(0.0))
    }
}

/// The three immutable policies, one per profile.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    /// Policy for [`RetryProfile::Generic`]
    pub generic: RetryPolicy,
    /// Policy for [`RetryProfile::Backpressure`]
    pub backpressure: RetryPolicy,
    /// Policy for [`RetryProfile::Streaming`]
    pub streaming: RetryPolicy,
}

impl RetryPolicies {
    /// Look up the policy for a profile.
    pub fn for_profile(&self, profile: RetryProfile) -> &RetryPolicy {
        match profile {
            RetryProfile::Generic => &self.generic,
            RetryProfile::Backpressure => &self.backpressure,
            RetryProfile::Streaming => &self.streaming,
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            generic: RetryPolicy::generic(),
            backpressure: RetryPolicy::backpressure(),
            streaming: RetryPolicy::streaming(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            0.0,
            [ErrorClass::Transient],
        )
        .unwrap();

        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_monotonic_and_bounded() {
        let policy = RetryPolicy::generic();
        for n in 0..64 {
            let current = policy.base_delay(n);
            let next = policy.base_delay(n + 1);
            assert!(next >= current);
            assert!(next <= policy.max_delay);
            if next < policy.max_delay {
                assert_eq!(next, current * 2);
            }
        }
    }

    #[test]
    fn test_jitter_band() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(1_000),
            Duration::from_secs(10),
            0.5,
            [ErrorClass::Transient],
        )
        .unwrap();

        assert_eq!(policy.jittered_delay(0, 0.0), Duration::from_millis(1_000));
        assert_eq!(policy.jittered_delay(0, 1.0), Duration::from_millis(1_500));
        assert_eq!(policy.jittered_delay(0, -1.0), Duration::from_millis(500));
        // Out-of-range samples are clamped
        assert_eq!(policy.jittered_delay(0, 7.0), Duration::from_millis(1_500));
    }

    #[test]
    fn test_profile_classification() {
        let policies = RetryPolicies::default();
        let generic = policies.for_profile(RetryProfile::Generic);
        assert!(generic.is_retryable(ErrorClass::Transient));
        assert!(!generic.is_retryable(ErrorClass::Backpressure));

        let backpressure = policies.for_profile(RetryProfile::Backpressure);
        assert!(backpressure.is_retryable(ErrorClass::Backpressure));
        assert!(!backpressure.is_retryable(ErrorClass::Transient));
        assert!(backpressure.pre_delay > Duration::ZERO);

        let streaming = policies.for_profile(RetryProfile::Streaming);
        assert!(streaming.is_retryable(ErrorClass::Streaming));
        assert!(!streaming.is_retryable(ErrorClass::Transient));
    }

    #[test]
    fn test_validation_and_circuit_open_never_retryable() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
            0.0,
            [ErrorClass::Validation, ErrorClass::CircuitOpen, ErrorClass::Transient],
        )
        .unwrap();
        assert!(!policy.is_retryable(ErrorClass::Validation));
        assert!(!policy.is_retryable(ErrorClass::CircuitOpen));
        assert!(policy.is_retryable(ErrorClass::Transient));
    }

    #[test]
    fn test_invalid_policies() {
        let ms = Duration::from_millis;
        assert_eq!(
            RetryPolicy::new(0, ms(1), ms(2), 0.1, [ErrorClass::Transient]),
            Err(RetryPolicyError::ZeroAttempts)
        );
        assert_eq!(
            RetryPolicy::new(1, ms(1), ms(2), 1.5, [ErrorClass::Transient]),
            Err(RetryPolicyError::JitterOutOfRange(1.5))
        );
        assert!(matches!(
            RetryPolicy::new(1, ms(5), ms(2), 0.1, [ErrorClass::Transient]),
            Err(RetryPolicyError::DelayOrder { .. })
        ));
    }
}
