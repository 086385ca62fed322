//! Token bucket admission control.
//!
//! The limiter decides whether a request may proceed along one or more
//! [`RateLimitDimension`]s. Bucket state lives in the Shared Atomic Store; every
//! decision is a single [`AtomicStore::take_tokens`] round trip, so concurrent
//! callers across processes can never over-admit.
//!
//! # Fail-Open Behavior
//!
//! Admission favors availability. The request is allowed, with a warning, when
//! the store call fails, when the bucket parameters are unusable, or while the
//! store circuit breaker is open.
//!
//! # Shared Statistics
//!
//! Outcomes are mirrored into the store off the hot path. They go through a
//! bounded queue drained by one task, which folds each batch into a single
//! [`AtomicStore::hash_incr_all`] per dimension kind. When the queue is full
//! the outcome is left out of the mirror and counted in
//! [`TokenBucketLimiter::mirror_dropped`]; in-process counters are exact.

use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::config::RateLimitConfig;
use crate::application::metrics::{AdmissionStatistics, StatsCounters};
use crate::application::ports::{AtomicStore, Clock};
use crate::domain::bucket::{BucketRequest, TokenBucketState, LAST_REFILL_FIELD, TOKENS_FIELD};
use crate::domain::dimension::{
    bucket_params_valid, bucket_ttl_seconds, DimensionKind, RateLimitDimension,
};
use crate::domain::error::ResilienceError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STATS_TOTAL: &str = "total";
const STATS_ALLOWED: &str = "allowed";
const STATS_BLOCKED: &str = "blocked";
const MIRROR_BATCH: usize = 64;

/// Coordinates admission decisions against the shared store.
pub struct TokenBucketLimiter<S: AtomicStore> {
    store: Arc<S>,
    config: Arc<RateLimitConfig>,
    clock: Arc<dyn Clock>,
    counters: StatsCounters,
    breaker: Arc<CircuitBreaker>,
    mirror: Arc<StatsMirror<S>>,
}

impl<S: AtomicStore> Clone for TokenBucketLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            counters: self.counters.clone(),
            breaker: Arc::clone(&self.breaker),
            mirror: Arc::clone(&self.mirror),
        }
    }
}

impl<S: AtomicStore> std::fmt::Debug for TokenBucketLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.config)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore> TokenBucketLimiter<S> {
    /// Create a limiter.
    ///
    /// # Arguments
    /// * `store` - Shared Atomic Store holding the buckets
    /// * `config` - Per-dimension bucket parameters and breaker settings
    /// * `clock` - Time source for refill arithmetic
    /// * `counters` - Shared counters context
    pub fn new(
        store: Arc<S>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        counters: StatsCounters,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.clone(),
            Arc::clone(&clock),
        ));
        let mirror = Arc::new(StatsMirror::new(
            Arc::clone(&store),
            config.key_prefix.clone(),
            config.stats_mirror_capacity,
        ));
        Self {
            store,
            config: Arc::new(config),
            clock,
            counters,
            breaker,
            mirror,
        }
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The breaker guarding store round trips.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Check one dimension using its configured bucket parameters.
    ///
    /// A disabled dimension admits without touching the store.
    pub async fn check_admission(&self, dimension: &RateLimitDimension) -> bool {
        let config = self.config.dimension(dimension.kind());
        if !config.enabled {
            return true;
        }
        self.check_admission_with(
            dimension,
            config.capacity,
            config.requests_per_interval,
            config.interval_seconds,
            1.0,
        )
        .await
    }

    /// Check one dimension with explicit bucket parameters.
    ///
    /// Runs one refill-and-take step atomically in the store. Returns whether
    /// the request may proceed.
    pub async fn check_admission_with(
        &self,
        dimension: &RateLimitDimension,
        capacity: f64,
        rate: f64,
        interval_seconds: f64,
        cost: f64,
    ) -> bool {
        let kind = dimension.kind();

        if !bucket_params_valid(capacity, rate, interval_seconds) || !(cost.is_finite() && cost >= 0.0)
        {
            warn!(
                dimension = %dimension,
                capacity,
                rate,
                interval_seconds,
                cost,
                "Invalid rate limit parameters, failing open"
            );
            return self.fail_open(kind);
        }

        if !self.breaker.allow_request() {
            debug!(dimension = %dimension, "Store circuit open, failing open");
            return self.fail_open(kind);
        }

        let request = BucketRequest {
            capacity,
            rate,
            interval_seconds,
            cost,
            now: self.clock.unix_seconds(),
            ttl_seconds: bucket_ttl_seconds(interval_seconds),
        };

        let key = dimension.storage_key(&self.config.key_prefix);
        match self.store.take_tokens(&key, request).await {
            Ok(outcome) => {
                self.breaker.record_success();
                if !outcome.allowed {
                    debug!(
                        dimension = %dimension,
                        remaining = outcome.remaining,
                        "Rate limit exceeded"
                    );
                }
                self.record(kind, outcome.allowed);
                outcome.allowed
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(
                    error = %e,
                    dimension = %dimension,
                    "Rate limit store unavailable, failing open"
                );
                self.fail_open(kind)
            }
        }
    }

    /// Check every enabled dimension in order: Global, Ip, User, Endpoint.
    ///
    /// The first rejection short-circuits; later dimensions are not charged.
    /// Anonymous requests (`user_id == None`) skip the User dimension.
    pub async fn check_all_dimensions(
        &self,
        ip: &str,
        user_id: Option<&str>,
        endpoint: &str,
    ) -> bool {
        let mut dimensions = Vec::with_capacity(DimensionKind::ALL.len());
        dimensions.push(RateLimitDimension::global());
        dimensions.push(RateLimitDimension::ip(ip));
        if let Some(user_id) = user_id {
            dimensions.push(RateLimitDimension::user(user_id));
        }
        dimensions.push(RateLimitDimension::endpoint(endpoint));

        for dimension in &dimensions {
            if !self.check_admission(dimension).await {
                return false;
            }
        }
        true
    }

    /// Delete a dimension's bucket. Returns whether one existed.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the store call fails.
    pub async fn reset(&self, dimension: &RateLimitDimension) -> Result<bool, ResilienceError> {
        let key = dimension.storage_key(&self.config.key_prefix);
        Ok(self.store.delete(&key).await?)
    }

    /// Read a dimension's bucket without consuming tokens.
    ///
    /// The state is returned as last persisted, without refill applied.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the store call fails.
    pub async fn bucket_state(
        &self,
        dimension: &RateLimitDimension,
    ) -> Result<Option<TokenBucketState>, ResilienceError> {
        let key = dimension.storage_key(&self.config.key_prefix);
        let tokens = self.store.hash_get(&key, TOKENS_FIELD).await?;
        let last_refill = self.store.hash_get(&key, LAST_REFILL_FIELD).await?;

        Ok(match (parse_f64(tokens), parse_f64(last_refill)) {
            (Some(tokens), Some(last_refill)) => Some(TokenBucketState {
                tokens,
                last_refill,
            }),
            _ => None,
        })
    }

    /// In-process admission counters for one dimension kind.
    pub fn statistics(&self, kind: DimensionKind) -> AdmissionStatistics {
        self.counters.admission(kind)
    }

    /// Admission counters mirrored into the store, aggregated across every
    /// instance sharing it. `fail_open` is not mirrored and reads as 0.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the store call fails.
    pub async fn shared_statistics(
        &self,
        kind: DimensionKind,
    ) -> Result<AdmissionStatistics, ResilienceError> {
        let key = self.stats_key(kind);
        Ok(AdmissionStatistics {
            total: self.read_counter(&key, STATS_TOTAL).await?,
            allowed: self.read_counter(&key, STATS_ALLOWED).await?,
            blocked: self.read_counter(&key, STATS_BLOCKED).await?,
            fail_open: 0,
        })
    }

    /// Outcomes left out of shared statistics because the mirror queue was full.
    pub fn mirror_dropped(&self) -> u64 {
        self.mirror.dropped()
    }

    async fn read_counter(&self, key: &str, field: &str) -> Result<u64, ResilienceError> {
        let value = self.store.hash_get(key, field).await?;
        Ok(value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
    }

    fn stats_key(&self, kind: DimensionKind) -> String {
        stats_key(&self.config.key_prefix, kind)
    }

    fn fail_open(&self, kind: DimensionKind) -> bool {
        self.counters.record_fail_open(kind);
        self.counters.record_admission(kind, true);
        true
    }

    fn record(&self, kind: DimensionKind, allowed: bool) {
        self.counters.record_admission(kind, allowed);
        self.mirror.offer(MirroredOutcome { kind, allowed });
    }
}

fn stats_key(prefix: &str, kind: DimensionKind) -> String {
    format!("{}stats:{}", prefix, kind)
}

#[derive(Debug, Clone, Copy)]
struct MirroredOutcome {
    kind: DimensionKind,
    allowed: bool,
}

/// Bounded queue feeding shared statistics.
///
/// The drain task is spawned on first use, on the runtime of the first
/// admission check, and exits once every limiter clone is dropped.
struct StatsMirror<S: AtomicStore> {
    store: Arc<S>,
    key_prefix: String,
    capacity: usize,
    sender: OnceLock<mpsc::Sender<MirroredOutcome>>,
    dropped: AtomicU64,
}

impl<S: AtomicStore> StatsMirror<S> {
    fn new(store: Arc<S>, key_prefix: String, capacity: usize) -> Self {
        Self {
            store,
            key_prefix,
            capacity: capacity.max(1),
            sender: OnceLock::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn offer(&self, outcome: MirroredOutcome) {
        let sender = self.sender.get_or_init(|| {
            let (sender, receiver) = mpsc::channel(self.capacity);
            tokio::spawn(drain(
                Arc::clone(&self.store),
                self.key_prefix.clone(),
                receiver,
            ));
            sender
        });

        if sender.try_send(outcome).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain<S: AtomicStore>(
    store: Arc<S>,
    key_prefix: String,
    mut receiver: mpsc::Receiver<MirroredOutcome>,
) {
    let mut batch = Vec::with_capacity(MIRROR_BATCH);
    while receiver.recv_many(&mut batch, MIRROR_BATCH).await > 0 {
        let mut tallies: BTreeMap<DimensionKind, (i64, i64)> = BTreeMap::new();
        for outcome in batch.drain(..) {
            let (allowed, blocked) = tallies.entry(outcome.kind).or_default();
            if outcome.allowed {
                *allowed += 1;
            } else {
                *blocked += 1;
            }
        }

        for (kind, (allowed, blocked)) in tallies {
            let key = stats_key(&key_prefix, kind);
            let increments = [
                (STATS_TOTAL, allowed + blocked),
                (STATS_ALLOWED, allowed),
                (STATS_BLOCKED, blocked),
            ];
            if let Err(e) = store.hash_incr_all(&key, &increments).await {
                debug!(error = %e, key = %key, "Failed to mirror admission statistics");
            }
        }
    }
}

fn parse_f64(value: Option<String>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::application::ports::KeyTtl;
    use crate::domain::dimension::{DimensionConfig, MAX_BUCKET_TTL_SECONDS};
    use crate::infrastructure::memory_store::InMemoryStore;
    use crate::infrastructure::mocks::{FailingStore, MockClock};
    use std::time::Duration;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            global: DimensionConfig::new(1_000.0, 1_000.0, 1.0),
            ip: DimensionConfig::new(5.0, 5.0, 1.0),
            user: DimensionConfig::new(3.0, 3.0, 1.0),
            endpoint: DimensionConfig::new(2.0, 2.0, 1.0),
            ..RateLimitConfig::default()
        }
    }

    fn limiter_with<S: AtomicStore>(
        store: S,
        config: RateLimitConfig,
    ) -> (TokenBucketLimiter<S>, MockClock) {
        let clock = MockClock::at_unix(1_700_000_000);
        let limiter = TokenBucketLimiter::new(
            Arc::new(store),
            config,
            Arc::new(clock.clone()),
            StatsCounters::new(),
        );
        (limiter, clock)
    }

    fn limiter() -> (TokenBucketLimiter<InMemoryStore>, MockClock) {
        let clock = MockClock::at_unix(1_700_000_000);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let limiter = TokenBucketLimiter::new(
            Arc::new(store),
            config(),
            Arc::new(clock.clone()),
            StatsCounters::new(),
        );
        (limiter, clock)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_five_of_seven_allowed() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::ip("10.0.0.1");

        let mut allowed = 0;
        for _ in 0..7 {
            if limiter.check_admission(&dim).await {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);

        let stats = limiter.statistics(DimensionKind::Ip);
        assert_eq!((stats.total, stats.allowed, stats.blocked), (7, 5, 2));
    }

    #[tokio::test]
    async fn test_refill_after_interval() {
        let (limiter, clock) = limiter();
        let dim = RateLimitDimension::ip("10.0.0.1");
        for _ in 0..5 {
            assert!(limiter.check_admission(&dim).await);
        }
        assert!(!limiter.check_admission(&dim).await);

        // 5 tokens per second: 400ms buys back exactly two
        clock.advance(Duration::from_millis(400));
        assert!(limiter.check_admission(&dim).await);
        assert!(limiter.check_admission(&dim).await);
        assert!(!limiter.check_admission(&dim).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _) = limiter();
        for _ in 0..5 {
            assert!(limiter.check_admission(&RateLimitDimension::ip("a")).await);
        }
        assert!(!limiter.check_admission(&RateLimitDimension::ip("a")).await);
        assert!(limiter.check_admission(&RateLimitDimension::ip("b")).await);
    }

    #[tokio::test]
    async fn test_cost_consumes_multiple_tokens() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::endpoint("/export");
        assert!(limiter.check_admission_with(&dim, 10.0, 10.0, 1.0, 6.0).await);
        assert!(!limiter.check_admission_with(&dim, 10.0, 10.0, 1.0, 6.0).await);
        assert!(limiter.check_admission_with(&dim, 10.0, 10.0, 1.0, 4.0).await);
    }

    #[tokio::test]
    async fn test_invalid_parameters_fail_open() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::ip("10.0.0.1");
        for _ in 0..10 {
            assert!(limiter.check_admission_with(&dim, 0.0, 5.0, 1.0, 1.0).await);
            assert!(limiter.check_admission_with(&dim, 5.0, -1.0, 1.0, 1.0).await);
            assert!(limiter.check_admission_with(&dim, 5.0, 5.0, 0.0, 1.0).await);
        }
        assert_eq!(limiter.statistics(DimensionKind::Ip).fail_open, 30);
        assert_eq!(limiter.bucket_state(&dim).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_dimension_skips_store() {
        let mut config = config();
        config.ip = DimensionConfig::disabled();
        let (limiter, _) = limiter_with(FailingStore::new(), config);

        assert!(limiter.check_admission(&RateLimitDimension::ip("x")).await);
        assert_eq!(limiter.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (limiter, _) = limiter_with(FailingStore::new(), config());
        let dim = RateLimitDimension::ip("10.0.0.1");

        for _ in 0..3 {
            assert!(limiter.check_admission(&dim).await);
        }
        let stats = limiter.statistics(DimensionKind::Ip);
        assert_eq!(stats.fail_open, 3);
        assert_eq!(stats.blocked, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_stops_store_calls() {
        let mut config = config();
        config.breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        };
        let (limiter, clock) = limiter_with(FailingStore::new(), config);
        let dim = RateLimitDimension::ip("10.0.0.1");

        for _ in 0..10 {
            assert!(limiter.check_admission(&dim).await);
        }
        assert_eq!(limiter.breaker().state(), CircuitState::Open);
        assert_eq!(limiter.store.calls(), 3);

        // Store recovers; the half-open trial call closes the breaker
        limiter.store.set_failing(false);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check_admission(&dim).await);
        assert_eq!(limiter.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_short_circuit_leaves_later_dimensions_uncharged() {
        let (limiter, _) = limiter();

        // Endpoint capacity is 2: the last three calls are rejected there,
        // after the ip bucket has already been charged for them
        let mut passed = 0;
        for _ in 0..5 {
            if limiter.check_all_dimensions("1.2.3.4", None, "/a").await {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);
        let ip = limiter
            .bucket_state(&RateLimitDimension::ip("1.2.3.4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ip.tokens, 0.0);

        // Now the ip dimension rejects before the endpoint is consulted
        let before = limiter.statistics(DimensionKind::Endpoint).total;
        assert!(!limiter.check_all_dimensions("1.2.3.4", None, "/b").await);
        assert_eq!(limiter.statistics(DimensionKind::Endpoint).total, before);
        assert_eq!(
            limiter
                .bucket_state(&RateLimitDimension::endpoint("/b"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_anonymous_requests_skip_user_dimension() {
        let (limiter, _) = limiter();
        assert!(limiter.check_all_dimensions("1.2.3.4", None, "/a").await);
        assert_eq!(limiter.statistics(DimensionKind::User).total, 0);

        assert!(limiter.check_all_dimensions("1.2.3.4", Some("u1"), "/a").await);
        assert_eq!(limiter.statistics(DimensionKind::User).total, 1);
    }

    #[tokio::test]
    async fn test_reset_and_bucket_state() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::user("u1");
        assert_eq!(limiter.bucket_state(&dim).await.unwrap(), None);

        assert!(limiter.check_admission(&dim).await);
        let state = limiter.bucket_state(&dim).await.unwrap().unwrap();
        assert_eq!(state.tokens, 2.0);
        assert_eq!(state.last_refill, 1_700_000_000.0);

        assert!(limiter.reset(&dim).await.unwrap());
        assert!(!limiter.reset(&dim).await.unwrap());
        assert_eq!(limiter.bucket_state(&dim).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_statistics_are_mirrored_to_store() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::endpoint("/a");
        for _ in 0..3 {
            limiter.check_admission(&dim).await;
        }
        settle().await;

        let shared = limiter
            .shared_statistics(DimensionKind::Endpoint)
            .await
            .unwrap();
        assert_eq!((shared.total, shared.allowed, shared.blocked), (3, 2, 1));
    }

    #[tokio::test]
    async fn test_huge_interval_gets_bounded_bucket_ttl() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::endpoint("/slow");
        assert!(limiter.check_admission_with(&dim, 2.0, 1.0, 1e19, 1.0).await);
        assert!(limiter.check_admission_with(&dim, 2.0, 1.0, 1e19, 1.0).await);
        assert!(!limiter.check_admission_with(&dim, 2.0, 1.0, 1e19, 1.0).await);
        assert_eq!(limiter.statistics(DimensionKind::Endpoint).fail_open, 0);

        let key = dim.storage_key(&limiter.config().key_prefix);
        assert_eq!(
            limiter.store.ttl(&key).await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(MAX_BUCKET_TTL_SECONDS))
        );
    }

    #[tokio::test]
    async fn test_full_mirror_queue_drops_instead_of_growing() {
        let clock = MockClock::at_unix(1_700_000_000);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = TokenBucketLimiter::new(
            Arc::clone(&store),
            RateLimitConfig {
                stats_mirror_capacity: 4,
                ..config()
            },
            Arc::new(clock.clone()),
            StatsCounters::new(),
        );

        // The drain task cannot run until this task yields
        let dim = RateLimitDimension::global();
        for _ in 0..20 {
            assert!(limiter.check_admission(&dim).await);
        }
        assert_eq!(limiter.mirror_dropped(), 16);
        assert_eq!(limiter.statistics(DimensionKind::Global).total, 20);

        settle().await;
        let shared = limiter
            .shared_statistics(DimensionKind::Global)
            .await
            .unwrap();
        assert_eq!((shared.total, shared.allowed, shared.blocked), (4, 4, 0));

        // Drained capacity is available again
        assert!(limiter.check_admission(&dim).await);
        settle().await;
        let shared = limiter
            .shared_statistics(DimensionKind::Global)
            .await
            .unwrap();
        assert_eq!(shared.total, 5);
        assert_eq!(limiter.mirror_dropped(), 16);
    }

    #[tokio::test]
    async fn test_mirror_batches_outcomes_per_kind() {
        let (limiter, _) = limiter();
        for _ in 0..3 {
            limiter.check_admission(&RateLimitDimension::endpoint("/a")).await;
            limiter.check_admission(&RateLimitDimension::ip("10.0.0.1")).await;
        }
        settle().await;

        let endpoint = limiter
            .shared_statistics(DimensionKind::Endpoint)
            .await
            .unwrap();
        let ip = limiter.shared_statistics(DimensionKind::Ip).await.unwrap();
        assert_eq!((endpoint.total, endpoint.allowed, endpoint.blocked), (3, 2, 1));
        assert_eq!((ip.total, ip.allowed, ip.blocked), (3, 3, 0));
        assert_eq!(limiter.mirror_dropped(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_over_admit() {
        let (limiter, _) = limiter();
        let dim = RateLimitDimension::ip("hot");

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let dim = dim.clone();
                tokio::spawn(async move { limiter.check_admission(&dim).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }
}
