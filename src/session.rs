//! Execution sessions.
//!
//! A session owns one run: it stamps the run with an id and a save version,
//! builds the catalog, picks the runner and records the outcome in the
//! session's event log.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::ProjectConfig;
use crate::core::catalog::DataCatalog;
use crate::core::datasets::generate_version;
use crate::core::dispatcher::DistributedRunner;
use crate::core::event_store::EventStore;
use crate::core::pipeline::{Pipeline, PipelineError};
use crate::core::runner::{RunObserver, RunOutcome, Runner, SequentialRunner, SessionInfo};
use crate::domain::{Event, EventType, NodeStatus, Run};
use crate::pipelines::DEFAULT_PIPELINE;

/// Which runner executes the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RunnerKind {
    /// One node at a time on the calling task
    #[default]
    Sequential,

    /// Every node submitted to an execution client
    Distributed,
}

/// Everything `glacier run` can ask for
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pipeline: String,
    pub runner: RunnerKind,
    pub is_async: bool,
    pub nodes: Vec<String>,
    pub from_nodes: Vec<String>,
    pub to_nodes: Vec<String>,
    pub tags: Vec<String>,
    pub load_versions: HashMap<String, String>,
    /// Parameter overrides as a tree
    pub params: Value,
    /// Scheduler address overriding the configured one
    pub address: Option<String>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            pipeline: DEFAULT_PIPELINE.to_string(),
            runner: RunnerKind::default(),
            is_async: false,
            nodes: Vec::new(),
            from_nodes: Vec::new(),
            to_nodes: Vec::new(),
            tags: Vec::new(),
            load_versions: HashMap::new(),
            params: Value::Null,
            address: None,
        }
    }
}

impl RunRequest {
    /// Apply the node filters to `pipeline`
    pub fn filter(&self, pipeline: &Pipeline) -> Result<Pipeline, PipelineError> {
        let mut filtered = pipeline.clone();
        if !self.tags.is_empty() {
            filtered = filtered.only_nodes_with_tags(&self.tags)?;
        }
        if !self.nodes.is_empty() {
            filtered = filtered.only_nodes(&self.nodes)?;
        }
        if !self.from_nodes.is_empty() {
            filtered = filtered.from_nodes(&self.from_nodes)?;
        }
        if !self.to_nodes.is_empty() {
            filtered = filtered.to_nodes(&self.to_nodes)?;
        }
        Ok(filtered)
    }
}

/// One execution session
pub struct Session {
    config: ProjectConfig,
    info: SessionInfo,
    store: Arc<EventStore>,
    has_run: bool,
}

impl Session {
    /// New session with a fresh id and save version
    pub async fn create(config: ProjectConfig) -> Result<Self> {
        let mut info = SessionInfo::new(DEFAULT_PIPELINE);
        info.env = config.env.clone();
        info.save_version = generate_version();

        let store = EventStore::open(&config.sessions_dir(), info.session_id).await?;
        info!(session_id = %info.session_id, env = %info.env, save_version = %info.save_version, "Session created");

        Ok(Self {
            config,
            info,
            store: Arc::new(store),
            has_run: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn save_version(&self) -> &str {
        &self.info.save_version
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn events(&self) -> &EventStore {
        &self.store
    }

    /// Run one registered pipeline; a session runs at most once
    #[instrument(skip_all, fields(session_id = %self.info.session_id, pipeline = %request.pipeline))]
    pub async fn run(&mut self, pipelines: &BTreeMap<String, Pipeline>, request: RunRequest) -> Result<RunOutcome> {
        if self.has_run {
            bail!("Session {} has already run a pipeline; create a new session", self.info.session_id);
        }
        self.has_run = true;

        let registered = pipelines.get(&request.pipeline).with_context(|| {
            format!(
                "Unknown pipeline '{}'. Registered: {}",
                request.pipeline,
                pipelines.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })?;
        let pipeline = request
            .filter(registered)
            .with_context(|| format!("Failed to filter pipeline '{}'", request.pipeline))?;

        self.info.pipeline_name = request.pipeline.clone();
        self.info.load_versions = request.load_versions.clone();
        self.info.params = request.params.clone();

        let catalog = self
            .config
            .build_catalog(&self.info.save_version, &request.load_versions, &request.params)?;

        self.store
            .append(
                &Event::new(
                    self.info.session_id,
                    None,
                    EventType::RunStarted,
                    format!(
                        "Running '{}' ({} nodes) with the {:?} runner",
                        request.pipeline,
                        pipeline.len(),
                        request.runner
                    ),
                    NodeStatus::Running,
                )
                .with_pipeline(&request.pipeline),
            )
            .await?;

        let started = Instant::now();
        let result = self.execute(&pipeline, &catalog, &request).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let event = match &result {
            Ok(_) => {
                info!(duration_ms = elapsed, "Run completed");
                Event::new(
                    self.info.session_id,
                    None,
                    EventType::RunCompleted,
                    format!("Pipeline '{}' completed", request.pipeline),
                    NodeStatus::Completed,
                )
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Run failed");
                Event::new(
                    self.info.session_id,
                    None,
                    EventType::RunFailed,
                    format!("Pipeline '{}' failed", request.pipeline),
                    NodeStatus::Failed,
                )
                .with_error(format!("{:#}", e))
            }
        };
        self.store
            .append(&event.with_pipeline(&request.pipeline).with_duration(elapsed))
            .await?;

        result
    }

    async fn execute(&self, pipeline: &Pipeline, catalog: &DataCatalog, request: &RunRequest) -> Result<RunOutcome> {
        let runner: Box<dyn Runner> = match request.runner {
            RunnerKind::Sequential => Box::new(SequentialRunner::new(request.is_async)),
            RunnerKind::Distributed => {
                let mut settings = self.config.scheduler.clone();
                if let Some(address) = &request.address {
                    settings.address = address.clone();
                }
                Box::new(DistributedRunner::connect(&settings, request.is_async).await?)
            }
        };

        let observer: Arc<dyn RunObserver> = self.store.clone();
        let outcome = runner.run(pipeline, catalog, &self.info, observer).await?;
        Ok(outcome)
    }
}

/// Read a past session's run back from its event log
pub async fn load_run(sessions_dir: &Path, session_id: Uuid) -> Result<Run> {
    if !sessions_dir.join(session_id.to_string()).is_dir() {
        bail!("Session not found: {}", session_id);
    }
    let store = EventStore::open(sessions_dir, session_id).await?;
    let events = store.replay().await?;
    Run::from_events(&events).with_context(|| format!("Session {} has no recorded events", session_id))
}
