//! Error taxonomy for the resilience layer.
//!
//! Every failure that crosses a component boundary is expressed as a
//! [`ResilienceError`]. Store adapters translate their native errors into
//! [`StoreError`] so callers never see a raw client exception.
//!
//! Retry decisions are made on the [`ErrorClass`] of an error, obtained through
//! the [`Classify`] trait. Wrapped operations may return any error type that
//! converts into [`ResilienceError`]; the conversion picks the variant, and so
//! the class, that drives retries. Implementing [`Classify`] on the caller's own
//! error type has no effect on [`RecoveryEngine::wrap`].
//!
//! ```
//! use resilience_guard::{Classify, ErrorClass, ResilienceError};
//!
//! enum ClientError {
//!     Timeout,
//!     Overloaded,
//! }
//!
//! impl From<ClientError> for ResilienceError {
//!     fn from(err: ClientError) -> Self {
//!         match err {
//!             ClientError::Timeout => ResilienceError::transient("request timed out"),
//!             ClientError::Overloaded => ResilienceError::backpressure("try later"),
//!         }
//!     }
//! }
//!
//! let err: ResilienceError = ClientError::Overloaded.into();
//! assert_eq!(err.error_class(), ErrorClass::Backpressure);
//! let err: ResilienceError = ClientError::Timeout.into();
//! assert_eq!(err.error_class(), ErrorClass::Transient);
//! ```
//!
//! [`RecoveryEngine::wrap`]: crate::application::recovery::RecoveryEngine::wrap

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification used to decide whether a failure is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad caller input. Never retried.
    Validation,
    /// Timeout or network-class failure.
    Transient,
    /// Overload signal from a downstream dependency.
    Backpressure,
    /// Fault raised in the middle of a stream.
    Streaming,
    /// The shared store could not be reached or answered garbage.
    StoreUnavailable,
    /// A circuit breaker refused the call. Terminal.
    CircuitOpen,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::Backpressure => "backpressure",
            ErrorClass::Streaming => "streaming",
            ErrorClass::StoreUnavailable => "store_unavailable",
            ErrorClass::CircuitOpen => "circuit_open",
        };
        f.write_str(name)
    }
}

/// Classification of errors flowing through the recovery engine.
///
/// The engine classifies the [`ResilienceError`] an operation's error converts
/// into, never the operation's own error type.
pub trait Classify {
    /// The class that drives retry and fallback decisions.
    fn error_class(&self) -> ErrorClass;
}

/// Failure reported by a Shared Atomic Store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection refused, dropped or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered, but the reply could not be interpreted.
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl Classify for StoreError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::StoreUnavailable
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Errors surfaced by the resilience layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// Bad caller input, surfaced synchronously.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Timeout or network-class failure.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Downstream overload signal.
    #[error("backpressure: {0}")]
    Backpressure(String),
    /// Mid-stream fault.
    #[error("stream fault: {0}")]
    Streaming(String),
    /// The shared store failed.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    /// Distinguished service-unavailable error. Never degraded.
    #[error("service unavailable: circuit open for '{operation}'")]
    CircuitOpen {
        /// Operation whose circuit tripped
        operation: String,
    },
}

impl ResilienceError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        ResilienceError::Validation(message.into())
    }

    /// Shorthand for a transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        ResilienceError::Transient(message.into())
    }

    /// Shorthand for a backpressure signal.
    pub fn backpressure(message: impl Into<String>) -> Self {
        ResilienceError::Backpressure(message.into())
    }

    /// Shorthand for a stream fault.
    pub fn streaming(message: impl Into<String>) -> Self {
        ResilienceError::Streaming(message.into())
    }

    /// Check if this is the distinguished unavailable error.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

impl Classify for ResilienceError {
    fn error_class(&self) -> ErrorClass {
        match self {
            ResilienceError::Validation(_) => ErrorClass::Validation,
            ResilienceError::Transient(_) => ErrorClass::Transient,
            ResilienceError::Backpressure(_) => ErrorClass::Backpressure,
            ResilienceError::Streaming(_) => ErrorClass::Streaming,
            ResilienceError::StoreUnavailable(_) => ErrorClass::StoreUnavailable,
            ResilienceError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ResilienceError::validation("x").error_class(),
            ErrorClass::Validation
        );
        assert_eq!(
            ResilienceError::transient("x").error_class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ResilienceError::backpressure("x").error_class(),
            ErrorClass::Backpressure
        );
        assert_eq!(
            ResilienceError::streaming("x").error_class(),
            ErrorClass::Streaming
        );
        assert_eq!(
            ResilienceError::from(StoreError::Unavailable("down".into())).error_class(),
            ErrorClass::StoreUnavailable
        );
    }

    #[test]
    fn test_store_error_is_wrapped_transparently() {
        let err = ResilienceError::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }

    #[test]
    fn test_circuit_open_message() {
        let err = ResilienceError::CircuitOpen {
            operation: "payments".into(),
        };
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("payments"));
    }
}
