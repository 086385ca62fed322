//! Domain layer - pure business logic with no I/O.
//!
//! This layer contains the core concepts and invariants of the resilience layer:
//! - Error taxonomy and retry classification
//! - Rate limit dimensions and the token bucket step
//! - Retry profiles and backoff arithmetic
//! - Degraded payloads
//! - Blacklist entries and token masking
//!
//! All types in this layer are pure and easily testable.

pub mod bucket;
pub mod degradation;
pub mod dimension;
pub mod error;
pub mod retry;
pub mod revocation;
