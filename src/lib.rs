//! # resilience-guard
//!
//! Resilience primitives for services that share state through a remote store:
//!
//! - **Admission control**: token buckets along Global, Ip, User and Endpoint
//!   dimensions, refilled continuously and updated atomically in the store
//! - **Recovery**: retry with exponential backoff and jitter, then either a
//!   structured degraded payload or a hard circuit trip
//! - **Revocation**: a TTL-bounded blacklist of invalidated credentials
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_guard::{
//!     DegradationCategory, InMemoryStore, OperationSpec, Outcome, ResilienceError,
//!     ResilienceLayer, RevocationFailureMode,
//! };
//!
//! # async fn fetch_users() -> Result<Vec<String>, ResilienceError> { Ok(vec![]) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let layer = ResilienceLayer::builder(InMemoryStore::new())
//!     .with_revocation_failure_mode(RevocationFailureMode::FailClosed)
//!     .build()?;
//!
//! if !layer.check_all_dimensions("203.0.113.7", Some("user-42"), "/users").await {
//!     // reply 429
//! }
//!
//! let spec = OperationSpec::generic("list_users", DegradationCategory::User);
//! match layer.wrap(&spec, fetch_users).await? {
//!     Outcome::Success(users) => println!("{} users", users.len()),
//!     Outcome::Degraded(response) => println!("{}", response.payload),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Posture
//!
//! | Component | Store down | Caller sees |
//! |-----------|------------|-------------|
//! | Admission | Fails open (allows) | `true` plus a `warn!` |
//! | Recovery | Retried under the generic profile, then degraded | `Outcome::Degraded` |
//! | Revocation | Configured `RevocationFailureMode` | `true` or `false` |
//!
//! Callers only ever receive a real result, a degraded payload or
//! [`ResilienceError::CircuitOpen`]; raw store errors never escape.
//!
//! ## Stores
//!
//! [`InMemoryStore`] is a single-process store for tests and non-distributed
//! deployments. Enable the `redis-store` feature for `RedisStore`, which runs
//! the token bucket step as a Lua script.
//!
//! ## Configuration
//!
//! [`ResilienceConfig`] deserializes from TOML:
//!
//! ```rust
//! use resilience_guard::ResilienceConfig;
//!
//! let config = ResilienceConfig::from_toml_str(
//!     r#"
//!     [rate_limit.ip]
//!     capacity = 20
//!     requests_per_interval = 10
//!     interval_seconds = 1
//!
//!     [revocation]
//!     failure_mode = "fail_safe"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.rate_limit.ip.capacity, 20.0);
//! ```
//!
//! ## Observability
//!
//! All components write to one shared [`StatsCounters`] context:
//!
//! ```rust,no_run
//! # use resilience_guard::{DimensionKind, InMemoryStore, ResilienceLayer, RevocationFailureMode};
//! # let layer = ResilienceLayer::builder(InMemoryStore::new())
//! #     .with_revocation_failure_mode(RevocationFailureMode::FailSafe)
//! #     .build()
//! #     .unwrap();
//! let recovery = layer.recovery_statistics();
//! println!("success rate: {:.1}%", recovery.success_rate() * 100.0);
//!
//! let ip = layer.counters().admission(DimensionKind::Ip);
//! println!("ip block rate: {:.1}%", ip.block_rate() * 100.0);
//! ```
//!
//! Logs go through `tracing`; the crate never installs a subscriber. Tokens
//! are only ever logged masked.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    bucket::{BucketOutcome, BucketRequest, TokenBucketState},
    degradation::{DegradationCategory, DegradedResponse, DEGRADED_STATUS},
    dimension::{DimensionConfig, DimensionKind, RateLimitDimension, GLOBAL_KEY},
    error::{Classify, ErrorClass, ResilienceError, StoreError},
    retry::{RetryPolicies, RetryPolicy, RetryPolicyError, RetryProfile},
    revocation::{mask_token, BlacklistEntry, RevocationFailureMode, RevocationInfo},
};

pub use application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    config::{
        ConfigError, RateLimitConfig, ResilienceConfig, RetryConfig, RetryPolicyConfig,
        RevocationConfig,
    },
    limiter::TokenBucketLimiter,
    metrics::{AdmissionStatistics, RecoveryStatistics, RevocationStatistics, StatsCounters},
    ports::{AtomicStore, AuditEvent, AuditSink, Clock, KeyTtl},
    recovery::{Fallback, OperationSpec, Outcome, RecoveryEngine},
    revocation::RevocationStore,
};

pub use infrastructure::{
    audit::TracingAuditSink,
    clock::SystemClock,
    layer::{BuildError, ResilienceLayer, ResilienceLayerBuilder},
    memory_store::InMemoryStore,
};

#[cfg(feature = "redis-store")]
pub use infrastructure::redis_store::{RedisStore, RedisStoreConfig};
