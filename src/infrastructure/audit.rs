//! Audit sink that forwards events to `tracing`.

use crate::application::ports::{AuditEvent, AuditSink};

/// Emits each audit event as a structured `tracing` event on the
/// `resilience_guard::audit` target.
///
/// Installing a subscriber that routes this target to durable storage is the
/// host application's concern.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    /// Create the sink.
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "resilience_guard::audit",
            category = %event.category,
            operation = %event.operation,
            "{}",
            event.message
        );
    }
}
