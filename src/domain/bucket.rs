//! Token bucket state and the refill-and-take step.
//!
//! [`BucketRequest::apply`] is the reference implementation of one admission
//! step. Store adapters must execute the same arithmetic atomically per key:
//! the in-memory store calls it under the shard lock, the Redis store runs an
//! equivalent Lua script.
//!
//! ## Refill timestamp
//!
//! Refill is quantized to whole tokens (`floor(elapsed / interval * rate)`).
//! The persisted `last_refill` only moves forward by the time that the added
//! tokens account for, so sub-token progress survives frequent calls. A bucket
//! that refills to capacity resets `last_refill` to `now`.

use serde::{Deserialize, Serialize};

/// Hash field holding the available tokens.
pub const TOKENS_FIELD: &str = "tokens";

/// Hash field holding the last refill timestamp.
pub const LAST_REFILL_FIELD: &str = "last_refill";

/// Persisted bucket state for one dimension key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Unix timestamp (fractional seconds) of the last refill
    pub last_refill: f64,
}

/// Parameters of a single admission step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per interval
    pub rate: f64,
    /// Interval length in seconds
    pub interval_seconds: f64,
    /// Tokens consumed if admitted
    pub cost: f64,
    /// Current unix time in fractional seconds
    pub now: f64,
    /// Key expiry applied after the step
    pub ttl_seconds: u64,
}

/// Result of a single admission step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Tokens left after the step
    pub remaining: f64,
}

impl BucketRequest {
    /// Run one refill-and-take step against the current state.
    ///
    /// `None` means the bucket does not exist yet; it starts full.
    pub fn apply(&self, current: Option<TokenBucketState>) -> (TokenBucketState, BucketOutcome) {
        let TokenBucketState {
            tokens,
            last_refill,
        } = current.unwrap_or(TokenBucketState {
            tokens: self.capacity,
            last_refill: self.now,
        });

        // Clock skew between writers can put last_refill in the future.
        let elapsed = (self.now - last_refill).max(0.0);
        let to_add = (elapsed / self.interval_seconds * self.rate).floor();

        let mut tokens = (tokens.max(0.0) + to_add).min(self.capacity);
        let last_refill = if tokens >= self.capacity {
            self.now
        } else if to_add > 0.0 {
            (last_refill + to_add * self.interval_seconds / self.rate).min(self.now)
        } else {
            last_refill.min(self.now)
        };

        let allowed = tokens >= self.cost;
        if allowed {
            tokens -= self.cost;
        }

        let state = TokenBucketState {
            tokens,
            last_refill,
        };
        (
            state,
            BucketOutcome {
                allowed,
                remaining: tokens,
            },
        )
    }
}
