//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic against the Shared Atomic Store:
//! - Token bucket limiter (admission decisions)
//! - Recovery engine (retry, backoff, degradation)
//! - Revocation store (credential blacklist)
//! - Shared counters and the store circuit breaker
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod circuit_breaker;
pub mod config;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod recovery;
pub mod revocation;
