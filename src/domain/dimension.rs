//! Rate limit dimensions and their configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed key used for the single Global bucket.
pub const GLOBAL_KEY: &str = "global";

/// The axis a request is limited along.
///
/// Dimensions are evaluated in declaration order by the multi-dimension check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    /// One bucket shared by every request
    Global,
    /// Per client address
    Ip,
    /// Per authenticated user
    User,
    /// Per API endpoint
    Endpoint,
}

impl DimensionKind {
    /// All kinds, in evaluation order.
    pub const ALL: [DimensionKind; 4] = [
        DimensionKind::Global,
        DimensionKind::Ip,
        DimensionKind::User,
        DimensionKind::Endpoint,
    ];

    /// Stable lowercase name used in store keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Global => "global",
            DimensionKind::Ip => "ip",
            DimensionKind::User => "user",
            DimensionKind::Endpoint => "endpoint",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete bucket identity: a kind plus the key within that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitDimension {
    kind: DimensionKind,
    key: String,
}

impl RateLimitDimension {
    /// Create a dimension for an arbitrary kind and key.
    pub fn new(kind: DimensionKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    /// The single global dimension.
    pub fn global() -> Self {
        Self::new(DimensionKind::Global, GLOBAL_KEY)
    }

    /// Per-IP dimension.
    pub fn ip(ip: impl Into<String>) -> Self {
        Self::new(DimensionKind::Ip, ip)
    }

    /// Per-user dimension.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(DimensionKind::User, user_id)
    }

    /// Per-endpoint dimension.
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self::new(DimensionKind::Endpoint, endpoint)
    }

    /// The dimension kind.
    pub fn kind(&self) -> DimensionKind {
        self.kind
    }

    /// The key within the kind.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store key holding this dimension's bucket.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}{}:{}", prefix, self.kind, self.key)
    }
}

impl fmt::Display for RateLimitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Bucket parameters for one dimension kind.
///
/// Invalid values (non-positive capacity, rate or interval) are accepted here.
/// The limiter treats them as a misconfiguration and fails open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionConfig {
    /// Whether this dimension participates in admission checks
    pub enabled: bool,
    /// Maximum tokens the bucket can hold (burst size)
    pub capacity: f64,
    /// Tokens added per interval
    pub requests_per_interval: f64,
    /// Interval length in seconds
    pub interval_seconds: f64,
}

impl DimensionConfig {
    /// Create an enabled configuration.
    pub fn new(capacity: f64, requests_per_interval: f64, interval_seconds: f64) -> Self {
        Self {
            enabled: true,
            capacity,
            requests_per_interval,
            interval_seconds,
        }
    }

    /// Create a disabled configuration.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Check that the parameters describe a usable bucket.
    pub fn is_valid(&self) -> bool {
        bucket_params_valid(self.capacity, self.requests_per_interval, self.interval_seconds)
    }

    /// Store TTL for a bucket under this configuration (two intervals).
    pub fn ttl_seconds(&self) -> u64 {
        bucket_ttl_seconds(self.interval_seconds)
    }
}

impl Default for DimensionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100.0,
            requests_per_interval: 100.0,
            interval_seconds: 60.0,
        }
    }
}

pub(crate) fn bucket_params_valid(capacity: f64, rate: f64, interval_seconds: f64) -> bool {
    capacity.is_finite()
        && rate.is_finite()
        && interval_seconds.is_finite()
        && capacity > 0.0
        && rate > 0.0
        && interval_seconds > 0.0
}

/// Upper bound on a bucket's store TTL. A bucket idle this long starts full.
pub const MAX_BUCKET_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

pub(crate) fn bucket_ttl_seconds(interval_seconds: f64) -> u64 {
    ((interval_seconds * 2.0).ceil() as u64).clamp(1, MAX_BUCKET_TTL_SECONDS)
}
