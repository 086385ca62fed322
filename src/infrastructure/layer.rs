//! The resilience layer facade.
//!
//! [`ResilienceLayer`] wires the limiter, the recovery engine and the
//! revocation store to one Shared Atomic Store, one clock, one audit sink and
//! one counters context, and applies the global toggle.

use crate::application::{
    config::{ConfigError, ResilienceConfig},
    limiter::TokenBucketLimiter,
    metrics::{RecoveryStatistics, StatsCounters},
    ports::{AtomicStore, AuditSink, Clock},
    recovery::{OperationSpec, Outcome, RecoveryEngine},
    revocation::RevocationStore,
};
use crate::domain::dimension::{DimensionConfig, DimensionKind, RateLimitDimension};
use crate::domain::error::ResilienceError;
use crate::domain::revocation::{mask_token, RevocationFailureMode};
use crate::infrastructure::audit::TracingAuditSink;
use crate::infrastructure::clock::SystemClock;

use futures::stream::Stream;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Error returned when building a [`ResilienceLayer`] fails.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The deployment must choose how revocation lookups behave on store errors
    #[error("revocation failure mode must be set explicitly (fail_safe or fail_closed)")]
    MissingRevocationFailureMode,
    /// Configuration validation failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builder for constructing a [`ResilienceLayer`].
pub struct ResilienceLayerBuilder<S: AtomicStore> {
    store: Arc<S>,
    config: ResilienceConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    counters: Option<StatsCounters>,
}

impl<S: AtomicStore> ResilienceLayerBuilder<S> {
    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the global toggle.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Override one dimension's bucket parameters.
    pub fn with_dimension(mut self, kind: DimensionKind, config: DimensionConfig) -> Self {
        *self.config.rate_limit.dimension_mut(kind) = config;
        self
    }

    /// Choose how revocation lookups answer when the store fails.
    pub fn with_revocation_failure_mode(mut self, mode: RevocationFailureMode) -> Self {
        self.config.revocation.failure_mode = Some(mode);
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the audit sink. Defaults to [`TracingAuditSink`].
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Share an existing counters context.
    pub fn with_counters(mut self, counters: StatsCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Build the layer.
    ///
    /// # Errors
    /// * [`BuildError::MissingRevocationFailureMode`] if no failure mode was chosen
    /// * [`BuildError::Config`] if a retry profile is inconsistent
    pub fn build(self) -> Result<ResilienceLayer<S>, BuildError> {
        let failure_mode = self
            .config
            .revocation
            .failure_mode
            .ok_or(BuildError::MissingRevocationFailureMode)?;
        let policies = self.config.retry.policies()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink::new()));
        let counters = self.counters.unwrap_or_default();
        let enabled = self.config.enabled;

        let limiter = TokenBucketLimiter::new(
            Arc::clone(&self.store),
            self.config.rate_limit,
            Arc::clone(&clock),
            counters.clone(),
        );
        let recovery = RecoveryEngine::new(
            policies,
            counters.clone(),
            Arc::clone(&audit),
            Arc::clone(&clock),
        )
        .with_retries_enabled(enabled);
        let revocations = RevocationStore::new(
            self.store,
            self.config.revocation.key_prefix,
            failure_mode,
            clock,
            counters.clone(),
            audit,
        );

        Ok(ResilienceLayer {
            enabled,
            limiter,
            recovery,
            revocations,
            counters,
        })
    }
}

/// Admission control, recovery and revocation behind one handle.
///
/// Cheap to clone; clones share the store, breaker and counters.
///
/// # Global Toggle
///
/// When disabled, admission checks pass without touching the store and
/// wrapped operations run exactly once, going straight to their fallback on
/// failure. Revocation keeps working: it is a security control.
pub struct ResilienceLayer<S: AtomicStore> {
    enabled: bool,
    limiter: TokenBucketLimiter<S>,
    recovery: RecoveryEngine,
    revocations: RevocationStore<S>,
    counters: StatsCounters,
}

impl<S: AtomicStore> Clone for ResilienceLayer<S> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            limiter: self.limiter.clone(),
            recovery: self.recovery.clone(),
            revocations: self.revocations.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<S: AtomicStore> std::fmt::Debug for ResilienceLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("enabled", &self.enabled)
            .field("limiter", &self.limiter)
            .field("revocations", &self.revocations)
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore> ResilienceLayer<S> {
    /// Start building a layer over `store`.
    ///
    /// # Example
    ///
    /// ```
    /// use resilience_guard::{InMemoryStore, ResilienceLayer, RevocationFailureMode};
    ///
    /// let layer = ResilienceLayer::builder(InMemoryStore::new())
    ///     .with_revocation_failure_mode(RevocationFailureMode::FailClosed)
    ///     .build()
    ///     .expect("failed to build resilience layer");
    /// assert!(layer.is_enabled());
    /// ```
    pub fn builder(store: S) -> ResilienceLayerBuilder<S> {
        Self::builder_shared(Arc::new(store))
    }

    /// Start building a layer over a store that is shared elsewhere.
    pub fn builder_shared(store: Arc<S>) -> ResilienceLayerBuilder<S> {
        ResilienceLayerBuilder {
            store,
            config: ResilienceConfig::default(),
            clock: None,
            audit: None,
            counters: None,
        }
    }

    /// Check the global toggle.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check one dimension. The Global kind ignores `key`.
    pub async fn check_admission(&self, kind: DimensionKind, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let dimension = match kind {
            DimensionKind::Global => RateLimitDimension::global(),
            _ => RateLimitDimension::new(kind, key),
        };
        self.limiter.check_admission(&dimension).await
    }

    /// Check Global, Ip, User (if any) and Endpoint, stopping at the first rejection.
    pub async fn check_all_dimensions(
        &self,
        ip: &str,
        user_id: Option<&str>,
        endpoint: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        self.limiter.check_all_dimensions(ip, user_id, endpoint).await
    }

    /// Run `operation` with retry and fallback. See [`RecoveryEngine::wrap`].
    ///
    /// # Errors
    /// Validation and circuit-open failures, as described on
    /// [`RecoveryEngine::wrap`].
    pub async fn wrap<T, E, F, Fut>(
        &self,
        spec: &OperationSpec,
        operation: F,
    ) -> Result<Outcome<T>, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.recovery.wrap(spec, operation).await
    }

    /// Wrap a continuous operation. See [`RecoveryEngine::wrap_stream`].
    pub fn wrap_stream<T, E, F, St>(&self, spec: OperationSpec, factory: F) -> impl Stream<Item = T>
    where
        F: FnMut() -> St,
        St: Stream<Item = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.recovery.wrap_stream(spec, factory)
    }

    /// Check whether `token` is revoked. Unaffected by the global toggle.
    pub async fn is_revoked(&self, token: &str) -> bool {
        self.revocations.is_revoked(token).await
    }

    /// Revoke `token`. Returns whether the entry was written.
    pub async fn add_to_blacklist(&self, token: &str, reason: &str, ttl_seconds: u64) -> bool {
        match self.revocations.add(token, reason, ttl_seconds).await {
            Ok(()) => true,
            Err(e) => {
                warn!(token = %mask_token(token), error = %e, "Failed to revoke token");
                false
            }
        }
    }

    /// Snapshot of the recovery counters.
    pub fn recovery_statistics(&self) -> RecoveryStatistics {
        self.recovery.statistics()
    }

    /// Zero the recovery counters.
    pub fn reset_recovery_statistics(&self) {
        self.recovery.reset_statistics();
    }

    /// The shared counters context (admission, recovery, revocation).
    pub fn counters(&self) -> &StatsCounters {
        &self.counters
    }

    /// The admission limiter, for per-dimension maintenance.
    pub fn limiter(&self) -> &TokenBucketLimiter<S> {
        &self.limiter
    }

    /// The recovery engine.
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// The revocation store, for maintenance operations.
    pub fn revocations(&self) -> &RevocationStore<S> {
        &self.revocations
    }
}
