//! Retry, backoff and degradation for fallible async operations.
//!
//! [`RecoveryEngine::wrap`] drives one invocation through the state machine
//!
//! ```text
//! ATTEMPT -> SUCCESS
//! ATTEMPT -> BACKOFF -> ATTEMPT        (retryable, attempts left)
//! ATTEMPT -> DEGRADED | FAILED | TRIP  (terminal)
//! ```
//!
//! Attempts are counted locally and committed to [`StatsCounters`] together
//! with the terminal outcome. Dropping the future mid-retry therefore leaves
//! every counter untouched.

use crate::application::metrics::{RecoveryStatistics, StatsCounters, TerminalOutcome};
use crate::application::ports::{AuditEvent, AuditSink, Clock};
use crate::domain::degradation::{DegradationCategory, DegradedResponse};
use crate::domain::error::{Classify, ErrorClass, ResilienceError};
use crate::domain::retry::{RetryPolicies, RetryPolicy, RetryProfile};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const AUDIT_CATEGORY: &str = "recovery";

/// What happens when an invocation fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Answer with a degraded payload shaped by the category
    Degrade(DegradationCategory),
    /// Fail hard with [`ResilienceError::CircuitOpen`]
    CircuitBreak,
}

/// Static description of a wrapped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    /// Name used in logs, audit events and degraded payloads
    pub name: String,
    /// Retry profile governing the operation
    pub profile: RetryProfile,
    /// Terminal fallback
    pub fallback: Fallback,
}

impl OperationSpec {
    /// Describe an operation.
    pub fn new(name: impl Into<String>, profile: RetryProfile, fallback: Fallback) -> Self {
        Self {
            name: name.into(),
            profile,
            fallback,
        }
    }

    /// Generic profile, degrading to `category`.
    pub fn generic(name: impl Into<String>, category: DegradationCategory) -> Self {
        Self::new(name, RetryProfile::Generic, Fallback::Degrade(category))
    }

    /// Backpressure profile, degrading to `category`.
    pub fn backpressure(name: impl Into<String>, category: DegradationCategory) -> Self {
        Self::new(name, RetryProfile::Backpressure, Fallback::Degrade(category))
    }

    /// Streaming profile.
    pub fn streaming(name: impl Into<String>) -> Self {
        Self::new(
            name,
            RetryProfile::Streaming,
            Fallback::Degrade(DegradationCategory::Generic),
        )
    }

    /// Switch the fallback to a hard circuit trip.
    pub fn circuit_break(mut self) -> Self {
        self.fallback = Fallback::CircuitBreak;
        self
    }
}

/// Result of a wrapped invocation that did not fail hard.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation produced a real result
    Success(T),
    /// The operation failed and the degraded payload stands in for it
    Degraded(DegradedResponse),
}

impl<T> Outcome<T> {
    /// Check if this is a degraded answer.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }

    /// The real result, if any.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Degraded(_) => None,
        }
    }

    /// The degraded payload, if any.
    pub fn degraded(self) -> Option<DegradedResponse> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Degraded(response) => Some(response),
        }
    }
}

/// Wraps operations with retry, backoff and fallback.
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    policies: Arc<RetryPolicies>,
    counters: StatsCounters,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retries_enabled: bool,
}

impl RecoveryEngine {
    /// Create an engine.
    ///
    /// # Arguments
    /// * `policies` - One immutable policy per profile
    /// * `counters` - Shared counters context
    /// * `audit` - Sink for degradation and circuit trip events
    /// * `clock` - Time source for `degraded_at` stamps
    pub fn new(
        policies: RetryPolicies,
        counters: StatsCounters,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            counters,
            audit,
            clock,
            retries_enabled: true,
        }
    }

    /// Turn retries off: each invocation runs exactly once and goes straight
    /// to its fallback on failure. Pre-delays are skipped too.
    pub fn with_retries_enabled(mut self, enabled: bool) -> Self {
        self.retries_enabled = enabled;
        self
    }

    /// The policies this engine was built with.
    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Run `operation` under its retry profile.
    ///
    /// `operation` is called once per attempt. Its error is converted into a
    /// [`ResilienceError`] and classified to decide on retry.
    ///
    /// # Returns
    /// * `Ok(Outcome::Success)` - an attempt succeeded
    /// * `Ok(Outcome::Degraded)` - attempts ran out or the failure was not
    ///   retryable, and the fallback is [`Fallback::Degrade`]
    ///
    /// # Errors
    /// * [`ResilienceError::Validation`] and [`ResilienceError::CircuitOpen`]
    ///   from the operation propagate unchanged
    /// * [`ResilienceError::CircuitOpen`] when the fallback is
    ///   [`Fallback::CircuitBreak`]
    pub async fn wrap<T, E, F, Fut>(
        &self,
        spec: &OperationSpec,
        mut operation: F,
    ) -> Result<Outcome<T>, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let policy = self.policies.for_profile(spec.profile);
        let max_attempts = self.attempt_limit(policy);

        if self.retries_enabled && !policy.pre_delay.is_zero() {
            tokio::time::sleep(policy.pre_delay).await;
        }

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err: ResilienceError = match operation().await {
                Ok(value) => {
                    self.counters
                        .record_invocation(u64::from(attempts), TerminalOutcome::Success);
                    return Ok(Outcome::Success(value));
                }
                Err(err) => err.into(),
            };

            let class = err.error_class();
            if policy.is_retryable(class) && attempts < max_attempts {
                let delay = backoff_delay(policy, attempts - 1);
                debug!(
                    operation = %spec.name,
                    attempt = attempts,
                    error_class = %class,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return self.conclude(spec, u64::from(attempts), err);
        }
    }

    /// Wrap a continuous operation.
    ///
    /// `factory` opens (or reopens) the underlying stream. When the stream
    /// yields a retryable fault, the engine backs off and resubscribes; items
    /// already delivered are not replayed by the engine. When consecutive
    /// faults exhaust the policy, or a fault is not retryable, the returned
    /// stream simply ends.
    ///
    /// The terminal outcome is committed when the stream ends: a natural end
    /// counts as success, truncation as degradation (or failure for
    /// validation and circuit-open faults).
    pub fn wrap_stream<T, E, F, St>(&self, spec: OperationSpec, factory: F) -> impl Stream<Item = T>
    where
        F: FnMut() -> St,
        St: Stream<Item = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let policy = self.policies.for_profile(spec.profile).clone();
        let state = StreamState {
            engine: self.clone(),
            max_attempts: self.attempt_limit(&policy),
            pre_delay: if self.retries_enabled {
                policy.pre_delay
            } else {
                Duration::ZERO
            },
            policy,
            spec,
            factory,
            current: None,
            subscriptions: 0,
            consecutive_faults: 0,
        };

        stream::unfold(Some(state), |state| async move {
            let Some(mut state) = state else {
                return None;
            };
            loop {
                if state.current.is_none() {
                    if state.subscriptions == 0 && !state.pre_delay.is_zero() {
                        tokio::time::sleep(state.pre_delay).await;
                    }
                    state.subscriptions += 1;
                    state.current = Some(Box::pin((state.factory)()));
                }

                let next = match state.current.as_mut() {
                    Some(current) => current.next().await,
                    None => None,
                };

                match next {
                    Some(Ok(item)) => {
                        state.consecutive_faults = 0;
                        return Some((item, Some(state)));
                    }
                    None => {
                        state.engine.counters.record_invocation(
                            u64::from(state.subscriptions),
                            TerminalOutcome::Success,
                        );
                        return None;
                    }
                    Some(Err(err)) => {
                        let err: ResilienceError = err.into();
                        let class = err.error_class();
                        state.current = None;
                        state.consecutive_faults += 1;

                        if state.policy.is_retryable(class)
                            && state.consecutive_faults < state.max_attempts
                        {
                            let delay = backoff_delay(&state.policy, state.consecutive_faults - 1);
                            debug!(
                                operation = %state.spec.name,
                                fault = state.consecutive_faults,
                                error_class = %class,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "Resubscribing after stream fault"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        state.engine.truncate_stream(
                            &state.spec,
                            u64::from(state.subscriptions),
                            &err,
                        );
                        return None;
                    }
                }
            }
        })
    }

    /// Build a degraded response for `operation` and count it.
    ///
    /// The payload shape follows `category`, never the operation name.
    pub fn activate_degradation(
        &self,
        operation: &str,
        category: DegradationCategory,
        error: &ResilienceError,
    ) -> DegradedResponse {
        self.degrade(operation, category, 0, error)
    }

    /// Trip the hard-fail fallback for `operation` and count it.
    ///
    /// Never yields degraded data.
    pub fn activate_circuit_breaker(
        &self,
        operation: &str,
        error: &ResilienceError,
    ) -> ResilienceError {
        self.trip(operation, 0, error)
    }

    /// Snapshot of the recovery counters.
    pub fn statistics(&self) -> RecoveryStatistics {
        self.counters.recovery()
    }

    /// Zero the recovery counters.
    pub fn reset_statistics(&self) {
        self.counters.reset_recovery();
    }

    fn attempt_limit(&self, policy: &RetryPolicy) -> u32 {
        if self.retries_enabled {
            policy.max_attempts
        } else {
            1
        }
    }

    fn conclude<T>(
        &self,
        spec: &OperationSpec,
        attempts: u64,
        err: ResilienceError,
    ) -> Result<Outcome<T>, ResilienceError> {
        match err.error_class() {
            ErrorClass::Validation | ErrorClass::CircuitOpen => {
                debug!(
                    operation = %spec.name,
                    error = %err,
                    "Operation failed with a terminal error"
                );
                self.counters
                    .record_invocation(attempts, TerminalOutcome::Failure);
                Err(err)
            }
            _ => match spec.fallback {
                Fallback::Degrade(category) => Ok(Outcome::Degraded(self.degrade(
                    &spec.name,
                    category,
                    attempts,
                    &err,
                ))),
                Fallback::CircuitBreak => Err(self.trip(&spec.name, attempts, &err)),
            },
        }
    }

    fn degrade(
        &self,
        operation: &str,
        category: DegradationCategory,
        attempts: u64,
        err: &ResilienceError,
    ) -> DegradedResponse {
        warn!(
            operation = %operation,
            category = %category,
            attempts,
            error = %err,
            "Operation degraded"
        );
        self.audit.emit(AuditEvent::new(
            AUDIT_CATEGORY,
            operation,
            format!("degraded to {} payload after {} attempt(s): {}", category, attempts, err),
        ));
        self.counters
            .record_invocation(attempts, TerminalOutcome::Degradation);
        DegradedResponse::new(operation, category, err.to_string(), self.now())
    }

    fn trip(&self, operation: &str, attempts: u64, err: &ResilienceError) -> ResilienceError {
        error!(
            operation = %operation,
            attempts,
            error = %err,
            "Circuit breaker activated"
        );
        self.audit.emit(AuditEvent::new(
            AUDIT_CATEGORY,
            operation,
            format!("circuit opened after {} attempt(s): {}", attempts, err),
        ));
        self.counters
            .record_invocation(attempts, TerminalOutcome::CircuitTrip);
        ResilienceError::CircuitOpen {
            operation: operation.to_string(),
        }
    }

    fn truncate_stream(&self, spec: &OperationSpec, subscriptions: u64, err: &ResilienceError) {
        let outcome = match err.error_class() {
            ErrorClass::Validation | ErrorClass::CircuitOpen => TerminalOutcome::Failure,
            _ => TerminalOutcome::Degradation,
        };
        warn!(
            operation = %spec.name,
            subscriptions,
            error = %err,
            "Stream truncated"
        );
        self.audit.emit(AuditEvent::new(
            AUDIT_CATEGORY,
            spec.name.as_str(),
            format!("stream truncated after {} subscription(s): {}", subscriptions, err),
        ));
        self.counters.record_invocation(subscriptions, outcome);
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now())
    }
}

struct StreamState<F, St> {
    engine: RecoveryEngine,
    policy: RetryPolicy,
    max_attempts: u32,
    pre_delay: Duration,
    spec: OperationSpec,
    factory: F,
    current: Option<Pin<Box<St>>>,
    subscriptions: u32,
    consecutive_faults: u32,
}

fn backoff_delay(policy: &RetryPolicy, retry_index: u32) -> Duration {
    let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    policy.jittered_delay(retry_index, unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::{MockClock, RecordingAuditSink};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> (RecoveryEngine, RecordingAuditSink) {
        let audit = RecordingAuditSink::new();
        let engine = RecoveryEngine::new(
            RetryPolicies::default(),
            StatsCounters::new(),
            Arc::new(audit.clone()),
            Arc::new(MockClock::at_unix(1_700_000_000)),
        );
        (engine, audit)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let (engine, _) = engine();
        let spec = OperationSpec::generic("lookup", DegradationCategory::Data);

        let outcome = engine
            .wrap(&spec, || async { Ok::<_, ResilienceError>(7) })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success(7));

        let stats = engine.statistics();
        assert_eq!((stats.total_attempts, stats.successes), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let (engine, _) = engine();
        let spec = OperationSpec::generic("lookup", DegradationCategory::Data);
        let calls = AtomicU32::new(0);

        let outcome = engine
            .wrap(&spec, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ResilienceError::transient("timeout"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.success(), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = engine.statistics();
        assert_eq!((stats.total_attempts, stats.successes), (3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_after_exhaustion() {
        let (engine, audit) = engine();
        let spec = OperationSpec::generic("list_users", DegradationCategory::User);

        let outcome = engine
            .wrap(&spec, || async {
                Err::<(), _>(ResilienceError::transient("connection reset"))
            })
            .await
            .unwrap();

        let degraded = outcome.degraded().unwrap();
        assert!(degraded.is_degraded());
        assert_eq!(degraded.operation, "list_users");
        assert_eq!(degraded.payload["users"], serde_json::json!([]));

        let stats = engine.statistics();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.degradations, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(audit.events_in("recovery").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_propagates_without_retry() {
        let (engine, audit) = engine();
        let spec = OperationSpec::generic("create", DegradationCategory::Data);
        let calls = AtomicU32::new(0);

        let err = engine
            .wrap(&spec, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::validation("bad email")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, ResilienceError::validation("bad email"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.statistics().failures, 1);
        assert!(audit.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_class_degrades_immediately() {
        let (engine, _) = engine();
        // Backpressure is not retried by the generic profile
        let spec = OperationSpec::generic("search", DegradationCategory::Generic);
        let calls = AtomicU32::new(0);

        let outcome = engine
            .wrap(&spec, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::backpressure("429")) }
            })
            .await
            .unwrap();

        assert!(outcome.is_degraded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_break_fallback() {
        let (engine, audit) = engine();
        let spec = OperationSpec::generic("charge", DegradationCategory::Data).circuit_break();

        let err = engine
            .wrap(&spec, || async {
                Err::<(), _>(ResilienceError::transient("gateway timeout"))
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ResilienceError::CircuitOpen {
                operation: "charge".into()
            }
        );
        let stats = engine.statistics();
        assert_eq!(stats.circuit_trips, 1);
        assert_eq!(stats.degradations, 0);
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_pre_delay() {
        let (engine, _) = engine();
        let spec = OperationSpec::backpressure("bulk_import", DegradationCategory::Data);
        let started = tokio::time::Instant::now();
        let first_call = std::sync::Mutex::new(None);

        engine
            .wrap(&spec, || {
                first_call
                    .lock()
                    .unwrap()
                    .get_or_insert_with(tokio::time::Instant::now);
                async { Ok::<_, ResilienceError>(()) }
            })
            .await
            .unwrap();

        let first = first_call.lock().unwrap().unwrap();
        assert!(first - started >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stays_within_jitter_band() {
        let (engine, _) = engine();
        let spec = OperationSpec::generic("lookup", DegradationCategory::Data);
        let started = tokio::time::Instant::now();

        engine
            .wrap(&spec, || async {
                Err::<(), _>(ResilienceError::transient("timeout"))
            })
            .await
            .unwrap();

        // Two backoffs: 100ms and 200ms, each within +/-50%
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed <= Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_disabled_runs_once() {
        let (engine, _) = engine();
        let engine = engine.with_retries_enabled(false);
        let spec = OperationSpec::backpressure("bulk_import", DegradationCategory::Data);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let outcome = engine
            .wrap(&spec, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::backpressure("busy")) }
            })
            .await
            .unwrap();

        assert!(outcome.is_degraded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_counters_untouched() {
        let (engine, _) = engine();
        let spec = OperationSpec::generic("slow", DegradationCategory::Data);

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            engine.wrap(&spec, || async {
                Err::<(), _>(ResilienceError::transient("timeout"))
            }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(engine.statistics(), RecoveryStatistics::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_resubscribes_then_completes() {
        let (engine, _) = engine();
        let subscriptions = AtomicU32::new(0);

        let items: Vec<u32> = engine
            .wrap_stream(OperationSpec::streaming("feed"), || {
                let n = subscriptions.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    stream::iter(vec![Ok(1), Err(ResilienceError::streaming("reset"))]).boxed()
                } else {
                    stream::iter(vec![Ok(2), Ok(3)]).boxed()
                }
            })
            .collect()
            .await;

        assert_eq!(items, vec![1, 2, 3]);
        let stats = engine.statistics();
        assert_eq!((stats.total_attempts, stats.successes), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_truncates_silently_on_exhaustion() {
        let (engine, audit) = engine();

        let items: Vec<u32> = engine
            .wrap_stream(OperationSpec::streaming("feed"), || {
                stream::iter(vec![Err::<u32, _>(ResilienceError::streaming("reset"))])
            })
            .collect()
            .await;

        assert!(items.is_empty());
        let stats = engine.statistics();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.degradations, 1);
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_fallbacks_directly() {
        let (engine, _) = engine();
        let err = ResilienceError::transient("down");

        let degraded = engine.activate_degradation("profile", DegradationCategory::Auth, &err);
        assert_eq!(degraded.payload["authenticated"], serde_json::json!(false));
        assert_eq!(degraded.degraded_at.timestamp(), 1_700_000_000);

        let tripped = engine.activate_circuit_breaker("profile", &err);
        assert!(tripped.is_circuit_open());

        let stats = engine.statistics();
        assert_eq!((stats.degradations, stats.circuit_trips), (1, 1));

        engine.reset_statistics();
        assert_eq!(engine.statistics(), RecoveryStatistics::default());
    }
}
