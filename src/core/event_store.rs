//! Append-only session log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) under
//! `<sessions_dir>/<session_id>/events.jsonl` for easy inspection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, EventType, NodeStatus};

use super::runner::RunObserver;

/// File-based event store using JSONL format
pub struct EventStore {
    session_id: Uuid,

    /// Directory containing the session
    session_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the log of one session
    pub async fn open(sessions_dir: &Path, session_id: Uuid) -> Result<Self> {
        let session_dir = sessions_dir.join(session_id.to_string());

        fs::create_dir_all(&session_dir)
            .await
            .with_context(|| format!("Failed to create session directory: {}", session_dir.display()))?;

        Ok(Self {
            session_id,
            events_path: session_dir.join("events.jsonl"),
            session_dir,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event =
                serde_json::from_str(&line).with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// List all session IDs with a log under `sessions_dir`
    pub async fn list_sessions(sessions_dir: &Path) -> Result<Vec<Uuid>> {
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(sessions_dir)
            .await
            .with_context(|| format!("Failed to read sessions directory: {}", sessions_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(Ok(uuid)) = entry.file_name().to_str().map(Uuid::parse_str) {
                    sessions.push(uuid);
                }
            }
        }

        Ok(sessions)
    }

    async fn record(&self, event: Event) {
        if let Err(e) = self.append(&event).await {
            warn!(session_id = %self.session_id, error = %e, "Failed to record event");
        }
    }
}

#[async_trait]
impl RunObserver for EventStore {
    async fn node_submitted(&self, node: &str) {
        let event = Event::new(
            self.session_id,
            Some(node.to_string()),
            EventType::NodeSubmitted,
            format!("Submitted {}", node),
            NodeStatus::Submitted,
        );
        self.record(event).await;
    }

    async fn node_completed(&self, node: &str, duration_ms: Option<u64>) {
        let mut event = Event::new(
            self.session_id,
            Some(node.to_string()),
            EventType::NodeCompleted,
            format!("Completed {}", node),
            NodeStatus::Completed,
        );
        if let Some(ms) = duration_ms {
            event = event.with_duration(ms);
        }
        self.record(event).await;
    }

    async fn node_failed(&self, node: &str, error: &str) {
        let event = Event::new(
            self.session_id,
            Some(node.to_string()),
            EventType::NodeFailed,
            format!("Failed {}", node),
            NodeStatus::Failed,
        )
        .with_error(error.to_string());
        self.record(event).await;
    }
}
