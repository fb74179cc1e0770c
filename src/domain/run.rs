//! Run state reconstructed from a session's events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, NodeStatus};

/// One pipeline run within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Session identifier
    pub session_id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each node, keyed by node name
    pub node_statuses: BTreeMap<String, NodeStatus>,
}

impl Run {
    pub fn new(session_id: Uuid, pipeline_name: String) -> Self {
        Self {
            session_id,
            pipeline_name,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            node_statuses: BTreeMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self::new(first.session_id, String::new());
        run.started_at = first.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(ref pipeline) = event.pipeline {
                    self.pipeline_name = pipeline.clone();
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::NodeSubmitted | EventType::NodeCompleted | EventType::NodeFailed => {
                if let Some(ref node) = event.node {
                    self.node_statuses.insert(node.clone(), event.status);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    pub fn is_node_completed(&self, node: &str) -> bool {
        self.node_statuses
            .get(node)
            .map(|s| *s == NodeStatus::Completed)
            .unwrap_or(false)
    }

    /// Nodes that reported failure, in name order
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.node_statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Failed)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    #[default]
    Running,
    Completed,
    Failed { error: String },
}
