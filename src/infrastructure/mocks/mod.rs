//! Mock implementations for testing.
//!
//! This module provides test doubles for infrastructure adapters,
//! enabling controlled testing of application logic.

pub mod audit;
pub mod clock;
pub mod failing_store;
pub mod layer;

pub use audit::RecordingAuditSink;
pub use clock::MockClock;
pub use failing_store::FailingStore;
pub use layer::{CapturedEvent, MockCaptureLayer};
