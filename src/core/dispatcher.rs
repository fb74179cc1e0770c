//! Dependency-aware dispatch onto an execution client.
//!
//! Nodes are submitted in topological order. Each submission carries the
//! handles of the nodes it depends on, so by the time a node is submitted
//! every one of its dependencies already has a handle. The handles are only
//! synchronisation tokens: the worker re-reads its inputs from the catalog.
//!
//! Once everything is submitted the dispatcher waits on all handles as they
//! complete, releasing memory datasets whose readers have all finished. The
//! first failure aborts the wait and is reported; work already running on
//! independent branches is left to finish on its own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{self, ClientSettings, ExecutionClient, NodeTask, TaskHandle};

use super::catalog::DataCatalog;
use super::pipeline::Pipeline;
use super::runner::{
    collect_outputs, prepare, ReleasePlan, RunObserver, RunOutcome, Runner, RunnerError, SessionInfo,
};

/// Runner that hands every node to an [`ExecutionClient`]
pub struct DistributedRunner {
    client: Mutex<Option<Arc<dyn ExecutionClient>>>,
    is_async: bool,
}

impl DistributedRunner {
    /// Connect to the backend named in `settings`.
    ///
    /// Fails before anything is submitted if the scheduler is unreachable.
    pub async fn connect(settings: &ClientSettings, is_async: bool) -> Result<Self, RunnerError> {
        let client = adapters::connect(settings).await?;
        info!(address = client.address(), "Distributed runner connected");
        Ok(Self::with_client(client, is_async))
    }

    pub fn with_client(client: Arc<dyn ExecutionClient>, is_async: bool) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            is_async,
        }
    }

    /// Submit every node, then wait for all of them
    async fn dispatch(
        &self,
        client: &dyn ExecutionClient,
        pipeline: &Pipeline,
        catalog: Arc<DataCatalog>,
        session: Arc<SessionInfo>,
        observer: &dyn RunObserver,
    ) -> Result<(), RunnerError> {
        let dependencies = pipeline.node_dependencies();
        let mut handles: HashMap<String, TaskHandle> = HashMap::with_capacity(pipeline.len());

        for node in pipeline.topological_order() {
            let mut deps = Vec::new();
            if let Some(parents) = dependencies.get(node.name()) {
                for parent in parents {
                    let handle = handles.get(parent).ok_or_else(|| RunnerError::OutOfOrder {
                        node: node.name().to_string(),
                        dependency: parent.clone(),
                    })?;
                    deps.push(handle.clone());
                }
            }

            debug!(node = node.name(), deps = deps.len(), "Submitting node");
            let task = NodeTask {
                node: node.clone(),
                catalog: Arc::clone(&catalog),
                is_async: self.is_async,
                session: Arc::clone(&session),
            };
            let handle = client.submit(task, deps).await?;
            observer.node_submitted(node.name()).await;
            handles.insert(node.name().to_string(), handle);
        }

        let total = handles.len();
        let mut pending: FuturesUnordered<_> = handles
            .into_values()
            .map(|handle| async move {
                let result = handle.wait().await;
                (handle, result)
            })
            .collect();

        let mut releases = ReleasePlan::new(pipeline);
        let mut done = 0;
        while let Some((handle, result)) = pending.next().await {
            match result {
                Ok(()) => {
                    done += 1;
                    observer.node_completed(handle.key(), None).await;
                    info!(node = handle.key(), completed = done, total, "Completed node");
                    if let Some(node) = pipeline.node(handle.key()) {
                        releases.node_done(node, &catalog).await?;
                    }
                }
                Err(failure) => {
                    observer.node_failed(&failure.node, &failure.message).await;
                    return Err(failure.into());
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Runner for DistributedRunner {
    fn name(&self) -> &'static str {
        "distributed"
    }

    #[instrument(skip_all, fields(session_id = %session.session_id, pipeline = %session.pipeline_name))]
    async fn run(
        &self,
        pipeline: &Pipeline,
        catalog: &DataCatalog,
        session: &SessionInfo,
        observer: Arc<dyn RunObserver>,
    ) -> Result<RunOutcome, RunnerError> {
        let client = self.client.lock().await.take().ok_or(RunnerError::ClientReleased)?;

        let dispatched = match prepare(pipeline, catalog) {
            Ok(working) => {
                let working = Arc::new(working);
                self.dispatch(
                    client.as_ref(),
                    pipeline,
                    Arc::clone(&working),
                    Arc::new(session.clone()),
                    observer.as_ref(),
                )
                .await
                .map(|()| working)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = client.close().await {
            warn!(address = client.address(), error = %e, "Failed to release execution client");
        }

        let working = dispatched?;
        collect_outputs(pipeline, catalog, &working, session.session_id).await
    }
}
