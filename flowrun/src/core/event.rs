//! Events recorded on a stage status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event reported for a stage, kept in the stage status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "stage.completed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a new stage event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_add_data() {
        let event = StageEvent::new("test.event")
            .add_data("foo", serde_json::json!("bar"))
            .add_data("count", serde_json::json!(42));

        assert_eq!(event.data.len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = StageEvent::new("pod.scheduled").add_data("node", serde_json::json!("worker-1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pod.scheduled");
        let back: StageEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, back);
    }
}
