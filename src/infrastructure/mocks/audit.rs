//! Audit sink that records events in memory.

use crate::application::ports::{AuditEvent, AuditSink};
use std::sync::{Arc, Mutex};

/// Captures every emitted [`AuditEvent`] for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl RecordingAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events of one category.
    pub fn events_in(&self, category: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.category == category)
            .collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
