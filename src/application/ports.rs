//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::bucket::{BucketOutcome, BucketRequest};
use crate::domain::error::StoreError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Port for obtaining current wall-clock time.
///
/// Wall-clock time (not `Instant`) is required because bucket timestamps and
/// blacklist entries are shared between processes through the store.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> SystemTime;

    /// Current time as fractional unix seconds.
    fn unix_seconds(&self) -> f64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists without an expiry
    Persistent,
    /// The key expires after this duration
    Expires(Duration),
}

/// Port for the Shared Atomic Store.
///
/// Every method is a single round trip. Atomicity is guaranteed per call and
/// per key only; [`AtomicStore::take_tokens`] is the one multi-step
/// read-modify-write primitive and must be linearizable per key under
/// arbitrary concurrent callers.
#[async_trait]
pub trait AtomicStore: Send + Sync + Debug + 'static {
    /// Read a scalar value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a scalar value, optionally with an expiry. Overwrites and resets TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Read one field of a hash.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Write one field of a hash.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Increment an integer hash field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Increment several integer hash fields as one unit.
    ///
    /// The default issues one [`AtomicStore::hash_incr`] per field and is not
    /// atomic. Adapters override it with a single round trip.
    async fn hash_incr_all(&self, key: &str, increments: &[(&str, i64)]) -> Result<(), StoreError> {
        for (field, delta) in increments {
            self.hash_incr(key, field, *delta).await?;
        }
        Ok(())
    }

    /// Set a key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read a key's remaining lifetime.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Iterate keys starting with `prefix`, one page per call.
    ///
    /// Start with cursor 0; a returned cursor of 0 ends the iteration.
    /// Keys may repeat across pages; callers must tolerate duplicates.
    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Atomically run one token bucket step on the hash at `key`.
    ///
    /// Reads `tokens`/`last_refill`, applies [`BucketRequest::apply`],
    /// writes the new state back and sets the key's TTL, as one unit.
    async fn take_tokens(&self, key: &str, request: BucketRequest)
        -> Result<BucketOutcome, StoreError>;
}

/// Structured event handed to the audit sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event family (e.g. "rate_limit", "recovery", "revocation")
    pub category: String,
    /// Operation the event relates to
    pub operation: String,
    /// Human-readable description; never contains an unmasked token
    pub message: String,
}

impl AuditEvent {
    /// Create an event.
    pub fn new(
        category: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Port for fire-and-forget audit emission.
///
/// Implementations must not block and must swallow their own failures; the
/// primary path never waits on or fails because of the sink.
pub trait AuditSink: Send + Sync + Debug {
    /// Emit one event.
    fn emit(&self, event: AuditEvent);
}
