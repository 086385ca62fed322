//! Deployment configuration for the resilience layer.
//!
//! Sourcing configuration (files, env, remote) is the host's job. This module
//! only defines the shape, TOML parsing and validation.
//!
//! ```toml
//! enabled = true
//!
//! [rate_limit.ip]
//! capacity = 20
//! requests_per_interval = 10
//! interval_seconds = 1
//!
//! [rate_limit.breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 30
//!
//! [retry.generic]
//! max_attempts = 4
//! initial_delay_ms = 50
//!
//! [revocation]
//! failure_mode = "fail_closed"
//! ```

use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::domain::dimension::{DimensionConfig, DimensionKind};
use crate::domain::error::ErrorClass;
use crate::domain::retry::{RetryPolicies, RetryPolicy, RetryPolicyError, RetryProfile};
use crate::domain::revocation::RevocationFailureMode;
use serde::Deserialize;
use std::time::Duration;

/// Default prefix for bucket keys.
pub const DEFAULT_RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// Admission outcomes queued for the store before new ones are dropped.
pub const DEFAULT_STATS_MIRROR_CAPACITY: usize = 1024;

/// Default prefix for blacklist keys.
pub const DEFAULT_BLACKLIST_PREFIX: &str = "auth:blacklist:";

/// Error returned when configuration cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document did not parse or did not match the schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A retry profile is inconsistent
    #[error("retry profile '{profile}': {source}")]
    Retry {
        /// Profile whose settings are wrong
        profile: RetryProfile,
        /// What is wrong with it
        #[source]
        source: RetryPolicyError,
    },
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Global toggle. When false, admission always passes and wrapped
    /// operations run once without retry. Revocation is never switched off.
    pub enabled: bool,
    /// Admission control settings
    pub rate_limit: RateLimitConfig,
    /// Per-profile retry overrides
    pub retry: RetryConfig,
    /// Blacklist settings
    pub revocation: RevocationConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            revocation: RevocationConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if parsing or validation fails.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject nonsensical retry policies.
    ///
    /// Invalid dimension parameters are deliberately accepted: the limiter
    /// fails open on them at check time.
    ///
    /// # Errors
    /// Returns the first inconsistent profile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.policies().map(|_| ())
    }
}

/// Admission control settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Prefix of bucket keys in the store
    pub key_prefix: String,
    /// Single shared bucket
    pub global: DimensionConfig,
    /// Per client address
    pub ip: DimensionConfig,
    /// Per authenticated user
    pub user: DimensionConfig,
    /// Per endpoint
    pub endpoint: DimensionConfig,
    /// Breaker guarding store round trips
    pub breaker: CircuitBreakerConfig,
    /// Outcomes waiting to be mirrored into shared statistics. When the
    /// queue is full new outcomes are dropped from the mirror only.
    pub stats_mirror_capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_RATE_LIMIT_PREFIX.to_string(),
            global: DimensionConfig::new(10_000.0, 10_000.0, 60.0),
            ip: DimensionConfig::new(100.0, 100.0, 60.0),
            user: DimensionConfig::new(1_000.0, 1_000.0, 60.0),
            endpoint: DimensionConfig::new(500.0, 500.0, 60.0),
            breaker: CircuitBreakerConfig::default(),
            stats_mirror_capacity: DEFAULT_STATS_MIRROR_CAPACITY,
        }
    }
}

impl RateLimitConfig {
    /// Configuration for one dimension kind.
    pub fn dimension(&self, kind: DimensionKind) -> &DimensionConfig {
        match kind {
            DimensionKind::Global => &self.global,
            DimensionKind::Ip => &self.ip,
            DimensionKind::User => &self.user,
            DimensionKind::Endpoint => &self.endpoint,
        }
    }

    /// Mutable access to one dimension's configuration.
    pub fn dimension_mut(&mut self, kind: DimensionKind) -> &mut DimensionConfig {
        match kind {
            DimensionKind::Global => &mut self.global,
            DimensionKind::Ip => &mut self.ip,
            DimensionKind::User => &mut self.user,
            DimensionKind::Endpoint => &mut self.endpoint,
        }
    }
}

/// Retry overrides per profile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Overrides for the generic profile
    pub generic: RetryPolicyConfig,
    /// Overrides for the backpressure profile
    pub backpressure: RetryPolicyConfig,
    /// Overrides for the streaming profile
    pub streaming: RetryPolicyConfig,
}

impl RetryConfig {
    /// Build the three immutable policies.
    ///
    /// # Errors
    /// Returns the first profile whose merged settings are inconsistent.
    pub fn policies(&self) -> Result<RetryPolicies, ConfigError> {
        Ok(RetryPolicies {
            generic: self.generic.resolve(RetryProfile::Generic)?,
            backpressure: self.backpressure.resolve(RetryProfile::Backpressure)?,
            streaming: self.streaming.resolve(RetryProfile::Streaming)?,
        })
    }
}

/// Retry settings for one profile. Unset fields keep the profile default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first
    pub max_attempts: Option<u32>,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: Option<u64>,
    /// Cap on a single delay, in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Jitter band as a fraction of the delay
    pub jitter_fraction: Option<f64>,
    /// Fixed delay before the first attempt, in milliseconds
    pub pre_delay_ms: Option<u64>,
    /// Error classes to retry
    pub retry_on: Option<Vec<ErrorClass>>,
}

impl RetryPolicyConfig {
    /// Merge these overrides onto a profile's default policy.
    ///
    /// # Errors
    /// Returns [`ConfigError::Retry`] if the merged policy is inconsistent.
    pub fn resolve(&self, profile: RetryProfile) -> Result<RetryPolicy, ConfigError> {
        let base = match profile {
            RetryProfile::Generic => RetryPolicy::generic(),
            RetryProfile::Backpressure => RetryPolicy::backpressure(),
            RetryProfile::Streaming => RetryPolicy::streaming(),
        };

        let retry_on = self
            .retry_on
            .clone()
            .unwrap_or_else(|| base.retryable_classes().to_vec());

        RetryPolicy::new(
            self.max_attempts.unwrap_or(base.max_attempts),
            self.initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.initial_delay),
            self.max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.max_delay),
            self.jitter_fraction.unwrap_or(base.jitter_fraction),
            retry_on,
        )
        .map(|policy| {
            policy.with_pre_delay(
                self.pre_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.pre_delay),
            )
        })
        .map_err(|source| ConfigError::Retry { profile, source })
    }
}

/// Blacklist settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Prefix of blacklist keys in the store
    pub key_prefix: String,
    /// Answer given by lookups when the store fails.
    ///
    /// Left unset on purpose: building a layer without choosing one is an
    /// error.
    pub failure_mode: Option<RevocationFailureMode>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_BLACKLIST_PREFIX.to_string(),
            failure_mode: None,
        }
    }
}
