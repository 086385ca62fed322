//! Redis-backed implementation of the Shared Atomic Store.
//!
//! Lets several application instances share token buckets and the blacklist.
//!
//! ## Architecture
//!
//! - Scalars: plain strings, TTL via `SET EX`
//! - Buckets: hashes with `tokens` and `last_refill` fields
//! - Token bucket step: a server-side Lua script, so refill-and-take is one
//!   atomic unit per key no matter how many instances call it
//! - Enumeration: cursor-based `SCAN MATCH <prefix>*`
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! on its own. Every Redis failure is mapped into [`StoreError`]; what to do
//! about it (fail open, fail closed) is decided by the callers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use resilience_guard::{RedisStore, RedisStoreConfig, ResilienceLayer, RevocationFailureMode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisStore::connect_with_config(
//!         "redis://127.0.0.1/",
//!         RedisStoreConfig {
//!             key_namespace: "billing:".to_string(),
//!         },
//!     )
//!     .await
//!     .expect("Failed to connect to Redis");
//!
//!     let layer = ResilienceLayer::builder(store)
//!         .with_revocation_failure_mode(RevocationFailureMode::FailClosed)
//!         .build()
//!         .unwrap();
//! }
//! ```

use crate::application::ports::{AtomicStore, KeyTtl};
use crate::domain::bucket::{BucketOutcome, BucketRequest};
use crate::domain::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::time::Duration;

// Mirrors BucketRequest::apply. Remaining tokens travel back as a string
// because Lua numbers are truncated to integers in replies.
const TAKE_TOKENS_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last_refill = now
elseif last_refill == nil then
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local to_add = math.floor(elapsed / interval * rate)
tokens = math.min(capacity, math.max(0, tokens) + to_add)

if tokens >= capacity then
  last_refill = now
elseif to_add > 0 then
  last_refill = math.min(now, last_refill + to_add * interval / rate)
else
  last_refill = math.min(now, last_refill)
end

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(last_refill))
redis.call('EXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone, Default)]
pub struct RedisStoreConfig {
    /// Prepended to every key, so several deployments can share one Redis
    /// database. Empty by default.
    pub key_namespace: String,
}

/// Redis-backed Shared Atomic Store.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    take_tokens_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            take_tokens_script: Script::new(TAKE_TOKENS_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_namespace, key)
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis rejects expiries whose absolute time overflows its millisecond clock.
const MAX_EXPIRE_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    let secs = if ttl.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs.max(1)
    };
    secs.min(MAX_EXPIRE_SECONDS)
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(self.key(key), value, ttl_seconds(ttl)).await?;
            }
            None => {
                let _: () = conn.set(self.key(key), value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let exists: bool = conn.exists(self.key(key)).await?;
        Ok(exists)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = conn.hget(self.key(key), field).await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = conn.hset(self.key(key), field, value).await?;
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let value: i64 = conn.hincr(self.key(key), field, delta).await?;
        Ok(value)
    }

    async fn hash_incr_all(&self, key: &str, increments: &[(&str, i64)]) -> Result<(), StoreError> {
        if increments.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, delta) in increments {
            pipe.hincr(&key, *field, *delta).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let seconds = i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX);
        let applied: bool = conn.expire(self.key(key), seconds).await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.connection();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;

        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0).unsigned_abs())),
        })
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.connection();
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        let keys = keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&self.config.key_namespace)
                    .map(str::to_string)
            })
            .collect();
        Ok((next, keys))
    }

    async fn take_tokens(
        &self,
        key: &str,
        request: BucketRequest,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.connection();
        let (allowed, remaining): (i64, String) = self
            .take_tokens_script
            .key(self.key(key))
            .arg(request.capacity)
            .arg(request.rate)
            .arg(request.interval_seconds)
            .arg(request.cost)
            .arg(request.now)
            .arg(request.ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        let remaining = remaining.parse::<f64>().map_err(|_| {
            StoreError::Protocol(format!("token bucket script returned '{}'", remaining))
        })?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            remaining,
        })
    }
}
