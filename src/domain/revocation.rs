//! Blacklist entries for revoked credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stance taken by revocation lookups when the store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationFailureMode {
    /// Treat the credential as not revoked (availability first).
    FailSafe,
    /// Treat the credential as revoked (security first).
    FailClosed,
}

impl RevocationFailureMode {
    /// The answer `is_revoked` gives when the store lookup failed.
    pub fn revoked_on_error(&self) -> bool {
        matches!(self, RevocationFailureMode::FailClosed)
    }
}

/// Persisted record for one revoked token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Why the token was revoked (e.g. "logout")
    pub reason: String,
    /// When the entry was written
    pub inserted_at: DateTime<Utc>,
    /// Lifetime granted at insertion
    pub ttl_seconds: u64,
}

impl BlacklistEntry {
    /// Create an entry.
    pub fn new(reason: impl Into<String>, inserted_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        Self {
            reason: reason.into(),
            inserted_at,
            ttl_seconds,
        }
    }

    /// Instant after which the entry is semantically absent.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        self.inserted_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check expiry against a given time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Entry metadata plus what the store reports about its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationInfo {
    /// The stored entry
    pub entry: BlacklistEntry,
    /// Remaining TTL as reported by the store, if it has one
    pub remaining_ttl: Option<Duration>,
}

/// Tokens shorter than this are logged as `***`.
const MASK_MIN_CHARS: usize = 12;
/// Tokens at least this long keep four characters at each end, shorter ones two.
const MASK_WIDE_CHARS: usize = 24;

/// Render a token for logs.
///
/// Never reveals more than a third of the token: under 12 characters nothing,
/// under 24 the first and last two, otherwise the first and last four.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let keep = match chars.len() {
        n if n < MASK_MIN_CHARS => return "***".to_string(),
        n if n < MASK_WIDE_CHARS => 2,
        _ => 4,
    };
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{}...{}", head, tail)
}
