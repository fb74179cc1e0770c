//! Runners execute a pipeline against a catalog.
//!
//! Every runner shares the same preamble: check that the catalog can provide
//! each free input, then register default memory datasets for everything the
//! pipeline mentions but the catalog does not declare. What differs is how
//! nodes are scheduled; see [`SequentialRunner`] and
//! [`DistributedRunner`](super::dispatcher::DistributedRunner).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::adapters::{ClientError, TaskFailure};
use crate::domain::Data;

use super::catalog::{CatalogError, DataCatalog};
use super::datasets::generate_version;
use super::node::{Node, NodeError};
use super::pipeline::Pipeline;

/// Identity of one run, shipped to wherever nodes execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,

    /// Registered pipeline name
    pub pipeline_name: String,

    /// Configuration environment the catalog was built from
    pub env: String,

    /// Version stamped on every versioned dataset saved during the run
    pub save_version: String,

    /// Datasets pinned to a previously saved version
    #[serde(default)]
    pub load_versions: HashMap<String, String>,

    /// Parameter overrides given on the command line
    #[serde(default)]
    pub params: Value,
}

impl SessionInfo {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            env: crate::config::DEFAULT_ENV.to_string(),
            save_version: generate_version(),
            load_versions: HashMap::new(),
            params: Value::Null,
        }
    }
}

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("pipeline inputs not provided by the catalog: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Task(#[from] TaskFailure),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("node '{node}' reached before its dependency '{dependency}'")]
    OutOfOrder { node: String, dependency: String },

    #[error("execution client has already been released")]
    ClientReleased,
}

impl RunnerError {
    /// Name of the node whose failure aborted the run, if any
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            RunnerError::Node(e) => Some(e.node()),
            RunnerError::Task(f) => Some(&f.node),
            RunnerError::OutOfOrder { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: Uuid,

    /// Free outputs the catalog does not persist
    pub outputs: BTreeMap<String, Data>,
}

/// Receives node lifecycle notifications during a run
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn node_submitted(&self, _node: &str) {}

    async fn node_completed(&self, _node: &str, _duration_ms: Option<u64>) {}

    async fn node_failed(&self, _node: &str, _error: &str) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// A strategy for executing a pipeline
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        pipeline: &Pipeline,
        catalog: &DataCatalog,
        session: &SessionInfo,
        observer: Arc<dyn RunObserver>,
    ) -> Result<RunOutcome, RunnerError>;
}

/// Shared preamble: fail on unsatisfiable inputs, then fill in defaults
pub fn prepare(pipeline: &Pipeline, catalog: &DataCatalog) -> Result<DataCatalog, RunnerError> {
    let missing: Vec<String> = pipeline
        .inputs()
        .into_iter()
        .filter(|name| !catalog.contains(name))
        .collect();
    if !missing.is_empty() {
        return Err(RunnerError::MissingInputs(missing));
    }
    Ok(catalog.with_defaults(pipeline)?)
}

/// Load the pipeline's free outputs that only live in memory
pub async fn collect_outputs(
    pipeline: &Pipeline,
    declared: &DataCatalog,
    catalog: &DataCatalog,
    session_id: Uuid,
) -> Result<RunOutcome, RunnerError> {
    let mut outputs = BTreeMap::new();
    for name in pipeline.outputs() {
        if declared.contains(&name) || !catalog.exists(&name).await? {
            continue;
        }
        let data = catalog.load(&name).await?;
        outputs.insert(name, data);
    }
    Ok(RunOutcome { session_id, outputs })
}

/// Remaining consumers per dataset.
///
/// Memory datasets are dropped once every node reading them has finished.
/// Free inputs and outputs of the pipeline are never dropped.
#[derive(Debug, Clone)]
pub struct ReleasePlan {
    consumers: HashMap<String, usize>,
    retained: BTreeSet<String>,
}

impl ReleasePlan {
    pub fn new(pipeline: &Pipeline) -> Self {
        let mut consumers: HashMap<String, usize> = HashMap::new();
        for node in pipeline.nodes() {
            for input in node.data_inputs() {
                *consumers.entry(input.to_string()).or_default() += 1;
            }
        }
        let retained = pipeline.inputs().into_iter().chain(pipeline.outputs()).collect();
        Self { consumers, retained }
    }

    /// Count `node` as finished and release the memory datasets it was the
    /// last reader of
    pub async fn node_done(&mut self, node: &Node, catalog: &DataCatalog) -> Result<(), CatalogError> {
        for input in node.data_inputs() {
            let Some(remaining) = self.consumers.get_mut(input) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 && !self.retained.contains(input) && catalog.is_memory(input) {
                debug!(dataset = input, "Releasing dataset");
                catalog.release(input).await?;
            }
        }
        Ok(())
    }
}

/// Load a node's inputs, run its body on the blocking pool, save its outputs.
///
/// With `is_async` the loads (and saves) are issued concurrently.
#[instrument(skip(node, catalog), fields(node = %node.name()))]
pub async fn run_node(
    node: &Node,
    catalog: &DataCatalog,
    is_async: bool,
    session_id: Uuid,
) -> Result<(), NodeError> {
    let name = node.name();
    let catalog_error = |source| NodeError::Catalog {
        node: name.to_string(),
        source,
    };

    let inputs = if is_async {
        try_join_all(node.inputs().iter().map(|input| catalog.load(input)))
            .await
            .map_err(catalog_error)?
    } else {
        let mut inputs = Vec::with_capacity(node.inputs().len());
        for input in node.inputs() {
            inputs.push(catalog.load(input).await.map_err(catalog_error)?);
        }
        inputs
    };

    let body = node.clone();
    let outputs = tokio::task::spawn_blocking(move || body.call(inputs))
        .await
        .map_err(|e| NodeError::Aborted {
            node: name.to_string(),
            message: e.to_string(),
        })??;

    let saves = node.outputs().iter().zip(outputs);
    if is_async {
        try_join_all(saves.map(|(output, data)| catalog.save(output, data)))
            .await
            .map_err(catalog_error)?;
    } else {
        for (output, data) in saves {
            catalog.save(output, data).await.map_err(catalog_error)?;
        }
    }

    debug!("Node outputs saved");
    Ok(())
}

/// Runs nodes one at a time in topological order
#[derive(Debug, Clone, Default)]
pub struct SequentialRunner {
    is_async: bool,
}

impl SequentialRunner {
    pub fn new(is_async: bool) -> Self {
        Self { is_async }
    }
}

#[async_trait]
impl Runner for SequentialRunner {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn run(
        &self,
        pipeline: &Pipeline,
        catalog: &DataCatalog,
        session: &SessionInfo,
        observer: Arc<dyn RunObserver>,
    ) -> Result<RunOutcome, RunnerError> {
        let working = prepare(pipeline, catalog)?;
        let mut releases = ReleasePlan::new(pipeline);

        let order = pipeline.topological_order();
        info!(nodes = order.len(), session_id = %session.session_id, "Running pipeline sequentially");

        for (done, node) in order.iter().enumerate() {
            observer.node_submitted(node.name()).await;
            let started = Instant::now();

            if let Err(e) = run_node(node, &working, self.is_async, session.session_id).await {
                error!(node = node.name(), error = %e, "Node failed");
                observer.node_failed(node.name(), &e.to_string()).await;
                return Err(e.into());
            }

            let elapsed = started.elapsed().as_millis() as u64;
            observer.node_completed(node.name(), Some(elapsed)).await;
            info!(node = node.name(), completed = done + 1, total = order.len(), "Completed node");

            releases.node_done(node, &working).await?;
        }

        collect_outputs(pipeline, catalog, &working, session.session_id).await
    }
}
