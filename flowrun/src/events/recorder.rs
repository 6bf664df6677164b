//! Event recorder trait and implementations.

use parking_lot::RwLock;
use std::fmt;
use tracing::{info, warn};

use crate::core::ObjectReference;

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Expected progress.
    Normal,
    /// Something went wrong.
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

/// Receives user-facing events about objects the engine manages.
///
/// Recording is fire-and-forget: implementations must not fail and should
/// not block.
pub trait EventRecorder: Send + Sync {
    /// Records an event on `object`.
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// A recorder that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventRecorder;

impl EventRecorder for NoOpEventRecorder {
    fn record(&self, _object: &ObjectReference, _event_type: EventType, _reason: &str, _message: &str) {}
}

/// A recorder that writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventRecorder;

impl EventRecorder for LoggingEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                kind = %object.kind,
                namespace = %object.namespace,
                name = %object.name,
                reason,
                "{message}"
            ),
            EventType::Warning => warn!(
                kind = %object.kind,
                namespace = %object.namespace,
                name = %object.name,
                reason,
                "{message}"
            ),
        }
    }
}

/// One event kept by [`CollectingEventRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Object the event is about.
    pub object: ObjectReference,
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// A recorder that keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventRecorder {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Returns events with the given reason.
    #[must_use]
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    /// Returns the number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all recorded events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventRecorder for CollectingEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        self.events.write().push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectReference {
        ObjectReference::new("WorkflowRun", "ns", "run")
    }

    #[test]
    fn test_noop_and_logging_recorders() {
        NoOpEventRecorder.record(&object(), EventType::Normal, "GC", "done");
        LoggingEventRecorder.record(&object(), EventType::Warning, "Timeout", "too slow");
    }

    #[test]
    fn test_collecting_recorder() {
        let recorder = CollectingEventRecorder::new();
        assert!(recorder.is_empty());

        recorder.record(&object(), EventType::Normal, "StagePodCreated", "created");
        recorder.record(&object(), EventType::Warning, "Timeout", "expired");
        recorder.record(&object(), EventType::Warning, "Timeout", "stopped");

        assert_eq!(recorder.len(), 3);
        let timeouts = recorder.with_reason("Timeout");
        assert_eq!(timeouts.len(), 2);
        assert!(timeouts.iter().all(|e| e.event_type == EventType::Warning));

        recorder.clear();
        assert!(recorder.is_empty());
    }
}
