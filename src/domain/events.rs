//! Session events.
//!
//! Every run appends immutable events to its session log. The events are for
//! provenance only; scheduling never reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in a session's append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The session this event belongs to
    pub session_id: Uuid,

    /// Pipeline name (set on run events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Node name (if applicable)
    pub node: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Status of the node/run after this event
    pub status: NodeStatus,

    /// Time taken in milliseconds (for finished nodes and runs)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        session_id: Uuid,
        node: Option<String>,
        event_type: EventType,
        summary: String,
        status: NodeStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            pipeline: None,
            node,
            event_type,
            summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events recorded during a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run has started; the summary names pipeline and runner
    RunStarted,

    /// A run completed successfully
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A node was handed to the runner's executor
    NodeSubmitted,

    /// A node finished and its outputs are saved
    NodeCompleted,

    /// A node raised or could not load/save its data
    NodeFailed,
}

/// Status of a node or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("merge_data_node".to_string()),
            EventType::NodeSubmitted,
            "Submitted merge_data_node".to_string(),
            NodeStatus::Submitted,
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"node_submitted\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::NodeSubmitted);
        assert_eq!(parsed.status, NodeStatus::Submitted);
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("load_state_node".to_string()),
            EventType::NodeFailed,
            "Node failed".to_string(),
            NodeStatus::Failed,
        )
        .with_duration(12)
        .with_error("unknown column 'YEAR'".to_string());

        assert_eq!(event.duration_ms, Some(12));
        assert_eq!(event.error.as_deref(), Some("unknown column 'YEAR'"));
    }
}
