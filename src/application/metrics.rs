//! Process-wide counters for the resilience layer.
//!
//! All counters use atomic operations for lock-free updates and reads. A single
//! [`StatsCounters`] context is shared (cheaply cloned) between the limiter, the
//! recovery engine and the revocation store.

use crate::domain::dimension::DimensionKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters context.
#[derive(Debug, Clone, Default)]
pub struct StatsCounters {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    recovery: RecoveryCells,
    admission: [AdmissionCells; 4],
    revocation: RevocationCells,
}

#[derive(Debug, Default)]
struct RecoveryCells {
    total_attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    degradations: AtomicU64,
    circuit_trips: AtomicU64,
}

#[derive(Debug, Default)]
struct AdmissionCells {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    fail_open: AtomicU64,
}

#[derive(Debug, Default)]
struct RevocationCells {
    added: AtomicU64,
    removed: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    lookup_errors: AtomicU64,
}

/// Terminal outcome of one wrapped invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// The operation returned a real result
    Success,
    /// The failure propagated to the caller
    Failure,
    /// A degraded payload was returned
    Degradation,
    /// The circuit breaker fallback fired
    CircuitTrip,
}

impl StatsCounters {
    /// Create a fresh counters context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit one finished invocation: its attempts and its single terminal outcome.
    pub(crate) fn record_invocation(&self, attempts: u64, outcome: TerminalOutcome) {
        let cells = &self.inner.recovery;
        cells.total_attempts.fetch_add(attempts, Ordering::Relaxed);
        let counter = match outcome {
            TerminalOutcome::Success => &cells.successes,
            TerminalOutcome::Failure => &cells.failures,
            TerminalOutcome::Degradation => &cells.degradations,
            TerminalOutcome::CircuitTrip => &cells.circuit_trips,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admission decision for a dimension.
    pub(crate) fn record_admission(&self, kind: DimensionKind, allowed: bool) {
        let cells = &self.inner.admission[kind.index()];
        cells.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            cells.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            cells.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record that a dimension failed open.
    pub(crate) fn record_fail_open(&self, kind: DimensionKind) {
        self.inner.admission[kind.index()]
            .fail_open
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_revocation_added(&self) {
        self.inner.revocation.added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_revocation_removed(&self) {
        self.inner.revocation.removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_revocation_lookup(&self, hit: bool) {
        let cells = &self.inner.revocation;
        cells.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            cells.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_revocation_lookup_error(&self) {
        self.inner
            .revocation
            .lookup_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the recovery counters.
    pub fn recovery(&self) -> RecoveryStatistics {
        let cells = &self.inner.recovery;
        RecoveryStatistics {
            total_attempts: cells.total_attempts.load(Ordering::Relaxed),
            successes: cells.successes.load(Ordering::Relaxed),
            failures: cells.failures.load(Ordering::Relaxed),
            degradations: cells.degradations.load(Ordering::Relaxed),
            circuit_trips: cells.circuit_trips.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the admission counters for one dimension kind.
    pub fn admission(&self, kind: DimensionKind) -> AdmissionStatistics {
        let cells = &self.inner.admission[kind.index()];
        AdmissionStatistics {
            total: cells.total.load(Ordering::Relaxed),
            allowed: cells.allowed.load(Ordering::Relaxed),
            blocked: cells.blocked.load(Ordering::Relaxed),
            fail_open: cells.fail_open.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the revocation counters.
    pub fn revocation(&self) -> RevocationStatistics {
        let cells = &self.inner.revocation;
        RevocationStatistics {
            added: cells.added.load(Ordering::Relaxed),
            removed: cells.removed.load(Ordering::Relaxed),
            lookups: cells.lookups.load(Ordering::Relaxed),
            hits: cells.hits.load(Ordering::Relaxed),
            lookup_errors: cells.lookup_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset the recovery counters to zero.
    pub fn reset_recovery(&self) {
        let cells = &self.inner.recovery;
        cells.total_attempts.store(0, Ordering::Relaxed);
        cells.successes.store(0, Ordering::Relaxed);
        cells.failures.store(0, Ordering::Relaxed);
        cells.degradations.store(0, Ordering::Relaxed);
        cells.circuit_trips.store(0, Ordering::Relaxed);
    }

    /// Reset every counter to zero.
    ///
    /// Useful for testing or when starting a new monitoring period.
    pub fn reset(&self) {
        self.reset_recovery();
        for cells in &self.inner.admission {
            cells.total.store(0, Ordering::Relaxed);
            cells.allowed.store(0, Ordering::Relaxed);
            cells.blocked.store(0, Ordering::Relaxed);
            cells.fail_open.store(0, Ordering::Relaxed);
        }
        let cells = &self.inner.revocation;
        cells.added.store(0, Ordering::Relaxed);
        cells.removed.store(0, Ordering::Relaxed);
        cells.lookups.store(0, Ordering::Relaxed);
        cells.hits.store(0, Ordering::Relaxed);
        cells.lookup_errors.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of the recovery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStatistics {
    /// Attempts made across all finished invocations
    pub total_attempts: u64,
    /// Invocations that returned a real result
    pub successes: u64,
    /// Invocations whose error propagated
    pub failures: u64,
    /// Invocations answered with a degraded payload
    pub degradations: u64,
    /// Invocations that tripped the circuit breaker
    pub circuit_trips: u64,
}

impl RecoveryStatistics {
    /// Number of finished invocations.
    pub fn invocations(&self) -> u64 {
        self.successes
            .saturating_add(self.failures)
            .saturating_add(self.degradations)
            .saturating_add(self.circuit_trips)
    }

    /// Ratio of successful invocations (0.0 to 1.0).
    ///
    /// Returns 0.0 if nothing has finished yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.invocations();
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// A point-in-time snapshot of one dimension's admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionStatistics {
    /// Decisions made
    pub total: u64,
    /// Requests admitted
    pub allowed: u64,
    /// Requests rejected
    pub blocked: u64,
    /// Admissions granted because the check itself failed
    pub fail_open: u64,
}

impl AdmissionStatistics {
    /// Calculate the rejection rate (0.0 to 1.0).
    pub fn block_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.blocked as f64 / self.total as f64
        }
    }
}

/// A point-in-time snapshot of the revocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevocationStatistics {
    /// Successful `add` calls
    pub added: u64,
    /// Entries explicitly removed or swept
    pub removed: u64,
    /// Completed `is_revoked` lookups
    pub lookups: u64,
    /// Lookups that found a revoked token
    pub hits: u64,
    /// Lookups answered by the failure mode
    pub lookup_errors: u64,
}
