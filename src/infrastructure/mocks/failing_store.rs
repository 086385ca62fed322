//! Store double whose calls can be switched to fail.

use crate::application::ports::{AtomicStore, KeyTtl};
use crate::domain::bucket::{BucketOutcome, BucketRequest};
use crate::domain::error::StoreError;
use crate::infrastructure::memory_store::InMemoryStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store that fails every call while its switch is on.
///
/// When the switch is off, calls are forwarded to an inner [`InMemoryStore`],
/// which makes recovery scenarios (store comes back) testable.
///
/// # Examples
///
/// ```
/// use resilience_guard::application::ports::AtomicStore;
/// use resilience_guard::infrastructure::mocks::FailingStore;
///
/// # tokio_test_block(async {
/// let store = FailingStore::new();
/// assert!(store.get("k").await.is_err());
///
/// store.set_failing(false);
/// assert!(store.get("k").await.unwrap().is_none());
/// assert_eq!(store.calls(), 2);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FailingStore {
    inner: InMemoryStore,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl FailingStore {
    /// Create a store that starts out failing.
    pub fn new() -> Self {
        Self::wrapping(InMemoryStore::new())
    }

    /// Create a failing store over an existing in-memory store.
    pub fn wrapping(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Turn failure injection on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls received, failed or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.hash_get(key, field).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.check()?;
        self.inner.hash_incr(key, field, delta).await
    }

    async fn hash_incr_all(&self, key: &str, increments: &[(&str, i64)]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.hash_incr_all(key, increments).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.check()?;
        self.inner.scan(prefix, cursor, count).await
    }

    async fn take_tokens(
        &self,
        key: &str,
        request: BucketRequest,
    ) -> Result<BucketOutcome, StoreError> {
        self.check()?;
        self.inner.take_tokens(key, request).await
    }
}
