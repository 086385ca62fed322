//! In-process implementation of the Shared Atomic Store.
//!
//! Backed by a sharded `DashMap`. Per-key atomicity of
//! [`AtomicStore::take_tokens`] comes from holding the shard's write lock for
//! the whole read-modify-write, which is only meaningful inside one process.
//!
//! **Use this store for single-process deployments and tests.** Multiple
//! instances sharing rate limits or a blacklist need a distributed store
//! (see `RedisStore`, behind the `redis-store` feature).
//!
//! Expiry is lazy: expired keys behave as absent and are dropped the next time
//! they are touched or when [`InMemoryStore::purge_expired`] runs. A TTL too
//! large to represent as a deadline leaves the key without expiry.
//!
//! Scans walk keys in a fixed hash order and the cursor is a position in that
//! order, so keys deleted or added between pages never shift the ones still to
//! come. A key present for the whole iteration is returned at least once.

use crate::application::ports::{AtomicStore, Clock, KeyTtl};
use crate::domain::bucket::{
    BucketOutcome, BucketRequest, TokenBucketState, LAST_REFILL_FIELD, TOKENS_FIELD,
};
use crate::domain::error::StoreError;
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<SystemTime>,
}

impl StoredEntry {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Thread-safe in-memory store with TTL support.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, StoredEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by a custom clock (mainly for testing).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.map.iter().filter(|e| e.value().is_live(now)).count()
    }

    /// Check if no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Drop all expired keys, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.map.len())
    }

    fn live_value<R>(&self, key: &str, f: impl FnOnce(&StoredValue) -> R) -> Option<R> {
        let now = self.clock.now();
        let result = {
            let entry = self.map.get(key)?;
            if entry.is_live(now) {
                Some(f(&entry.value))
            } else {
                None
            }
        };
        if result.is_none() {
            self.map.remove_if(key, |_, entry| !entry.is_live(now));
        }
        result
    }

    /// Lock `key`, replacing an expired entry with an empty hash.
    fn live_hash_entry(&self, key: &str) -> RefMut<'_, String, StoredEntry> {
        let now = self.clock.now();
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::Hash(HashMap::new()),
                expires_at: None,
            });
        if !entry.is_live(now) {
            *entry = StoredEntry {
                value: StoredValue::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        entry
    }

    fn expiry_from(&self, ttl: Option<Duration>) -> Option<SystemTime> {
        ttl.and_then(|ttl| deadline(self.clock.now(), ttl))
    }
}

/// `now + ttl`, or `None` when the deadline is not representable.
fn deadline(now: SystemTime, ttl: Duration) -> Option<SystemTime> {
    now.checked_add(ttl)
}

/// Position of a key in scan order. Stable for the life of the process.
fn scan_position(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn parse_counter(field: &str, raw: Option<&String>) -> Result<i64, StoreError> {
    match raw {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            StoreError::Protocol(format!("hash field '{}' is not an integer", field))
        }),
        None => Ok(0),
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_value(key, |value| value.clone()) {
            None => Ok(None),
            Some(StoredValue::Text(text)) => Ok(Some(text)),
            Some(StoredValue::Hash(_)) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.map.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value.to_string()),
                expires_at: self.expiry_from(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key, |_| ()).is_some())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self.live_value(key, |value| match value {
            StoredValue::Hash(fields) => Ok(fields.get(field).cloned()),
            StoredValue::Text(_) => Err(wrong_type(key)),
        }) {
            None => Ok(None),
            Some(result) => result,
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut entry = self.live_hash_entry(key);
        match &mut entry.value {
            StoredValue::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            StoredValue::Text(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entry = self.live_hash_entry(key);
        let fields = match &mut entry.value {
            StoredValue::Hash(fields) => fields,
            StoredValue::Text(_) => return Err(wrong_type(key)),
        };
        let next = parse_counter(field, fields.get(field))?.saturating_add(delta);
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_incr_all(&self, key: &str, increments: &[(&str, i64)]) -> Result<(), StoreError> {
        let mut entry = self.live_hash_entry(key);
        let fields = match &mut entry.value {
            StoredValue::Hash(fields) => fields,
            StoredValue::Text(_) => return Err(wrong_type(key)),
        };
        // Validate every field before touching any, so the update is all or nothing
        let mut updated = Vec::with_capacity(increments.len());
        for (field, delta) in increments {
            let next = parse_counter(field, fields.get(*field))?.saturating_add(*delta);
            updated.push((field.to_string(), next.to_string()));
        }
        fields.extend(updated);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        match self.map.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = deadline(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = self.clock.now();
        let expires_at = match self.live_value(key, |_| ()) {
            None => return Ok(KeyTtl::Missing),
            Some(()) => self.map.get(key).and_then(|entry| entry.expires_at),
        };
        Ok(match expires_at {
            None => KeyTtl::Persistent,
            Some(at) => KeyTtl::Expires(at.duration_since(now).unwrap_or(Duration::ZERO)),
        })
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let now = self.clock.now();
        let mut remaining: Vec<(u64, String)> = self
            .map
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| (scan_position(entry.key()), entry.key().clone()))
            .filter(|(position, _)| *position >= cursor)
            .collect();
        remaining.sort_unstable();

        let mut end = count.max(1).min(remaining.len());
        // Keys sharing a position are never split across pages
        while end < remaining.len() && remaining[end].0 == remaining[end - 1].0 {
            end += 1;
        }

        // Positions on this page are >= cursor, so the next one is never 0
        let next = remaining.get(end).map_or(0, |(position, _)| *position);
        remaining.truncate(end);
        Ok((next, remaining.into_iter().map(|(_, key)| key).collect()))
    }

    async fn take_tokens(
        &self,
        key: &str,
        request: BucketRequest,
    ) -> Result<BucketOutcome, StoreError> {
        let now = self.clock.now();
        // The entry guard holds the shard write lock for the whole step
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::Hash(HashMap::new()),
                expires_at: None,
            });
        if !entry.is_live(now) {
            entry.value = StoredValue::Hash(HashMap::new());
        }

        let fields = match &mut entry.value {
            StoredValue::Hash(fields) => fields,
            StoredValue::Text(_) => return Err(wrong_type(key)),
        };
        let current = match (
            fields.get(TOKENS_FIELD).and_then(|v| v.parse::<f64>().ok()),
            fields.get(LAST_REFILL_FIELD).and_then(|v| v.parse::<f64>().ok()),
        ) {
            (Some(tokens), Some(last_refill)) => Some(TokenBucketState {
                tokens,
                last_refill,
            }),
            (Some(tokens), None) => Some(TokenBucketState {
                tokens,
                last_refill: request.now,
            }),
            _ => None,
        };

        let (state, outcome) = request.apply(current);
        fields.insert(TOKENS_FIELD.to_string(), state.tokens.to_string());
        fields.insert(LAST_REFILL_FIELD.to_string(), state.last_refill.to_string());
        entry.expires_at = deadline(now, Duration::from_secs(request.ttl_seconds));

        Ok(outcome)
    }
}
