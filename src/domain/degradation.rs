//! Typed fallback payloads returned once retries are exhausted.
//!
//! The payload shape is chosen by an explicit [`DegradationCategory`] that the
//! caller supplies when wrapping an operation. Operation names are only used
//! for reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Status tag carried by every degraded response.
pub const DEGRADED_STATUS: &str = "DEGRADED";

/// Selects the shape of a degraded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationCategory {
    /// User lookups: an empty user list
    User,
    /// Data queries: an empty, non-cached result set
    Data,
    /// Authentication checks: unauthenticated, retry later
    Auth,
    /// Anything else: a bare notice
    Generic,
}

impl DegradationCategory {
    /// Build the category-specific payload body.
    pub fn payload(&self) -> Value {
        match self {
            DegradationCategory::User => json!({
                "users": [],
                "total": 0,
                "message": "User service temporarily unavailable, showing no users",
            }),
            DegradationCategory::Data => json!({
                "data": [],
                "cached": false,
                "message": "Data service temporarily unavailable, returning empty result",
            }),
            DegradationCategory::Auth => json!({
                "authenticated": false,
                "retry_later": true,
                "message": "Authentication service temporarily unavailable",
            }),
            DegradationCategory::Generic => json!({
                "message": "Service temporarily unavailable, please retry later",
            }),
        }
    }
}

impl fmt::Display for DegradationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DegradationCategory::User => "user",
            DegradationCategory::Data => "data",
            DegradationCategory::Auth => "auth",
            DegradationCategory::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Structured fallback value returned instead of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedResponse {
    /// Always [`DEGRADED_STATUS`]
    pub status: String,
    /// Category that selected the payload shape
    pub category: DegradationCategory,
    /// Name of the operation that degraded
    pub operation: String,
    /// The failure that caused the degradation
    pub error: String,
    /// When the degradation happened
    pub degraded_at: DateTime<Utc>,
    /// Category-shaped body
    pub payload: Value,
}

impl DegradedResponse {
    /// Build a degraded response for an operation.
    pub fn new(
        operation: impl Into<String>,
        category: DegradationCategory,
        error: impl Into<String>,
        degraded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: DEGRADED_STATUS.to_string(),
            category,
            operation: operation.into(),
            error: error.into(),
            degraded_at,
            payload: category.payload(),
        }
    }

    /// Check the status tag.
    pub fn is_degraded(&self) -> bool {
        self.status == DEGRADED_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape_follows_category() {
        assert_eq!(DegradationCategory::User.payload()["users"], json!([]));
        assert_eq!(DegradationCategory::Data.payload()["data"], json!([]));
        assert_eq!(
            DegradationCategory::Auth.payload()["authenticated"],
            json!(false)
        );
        assert!(DegradationCategory::Generic.payload()["message"].is_string());
    }

    #[test]
    fn test_operation_name_does_not_select_shape() {
        // An operation named like a user lookup still gets the Data shape
        let response =
            DegradedResponse::new("getUserById", DegradationCategory::Data, "timeout", Utc::now());
        assert!(response.payload.get("users").is_none());
        assert!(response.payload.get("data").is_some());
    }

    #[test]
    fn test_serialized_status_tag() {
        let response =
            DegradedResponse::new("report", DegradationCategory::Generic, "boom", Utc::now());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "DEGRADED");
        assert_eq!(value["category"], "generic");
        assert!(response.is_degraded());
    }
}
