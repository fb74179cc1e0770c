//! In-process worker pool.
//!
//! Every submission becomes a tokio task straight away. The task waits for
//! its dependencies, then for a free worker slot, then runs the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::core::runner::run_node;

use super::{ClientError, ExecutionClient, NodeTask, TaskFailure, TaskHandle};

/// Worker pool running nodes on the current tokio runtime
pub struct LocalCluster {
    address: String,
    workers: Arc<Semaphore>,
    closed: AtomicBool,
}

impl LocalCluster {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        info!(workers, "Starting local cluster");
        Self {
            address: format!("local://{}", workers),
            workers: Arc::new(Semaphore::new(workers)),
            closed: AtomicBool::new(false),
        }
    }

    /// Worker slots currently idle
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

#[async_trait]
impl ExecutionClient for LocalCluster {
    fn address(&self) -> &str {
        &self.address
    }

    async fn submit(&self, task: NodeTask, deps: Vec<TaskHandle>) -> Result<TaskHandle, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }

        let key = task.node.name().to_string();
        let workers = Arc::clone(&self.workers);

        let work = tokio::spawn(async move {
            for dep in &deps {
                dep.wait().await?;
            }

            let name = task.node.name();
            let _slot = workers
                .acquire_owned()
                .await
                .map_err(|_| TaskFailure::new(name, "worker pool shut down"))?;

            debug!(node = name, session_id = %task.session.session_id, "Worker picked up node");
            run_node(&task.node, &task.catalog, task.is_async, task.session.session_id)
                .await
                .map_err(|e| TaskFailure::from(&e))
        });

        let node = key.clone();
        Ok(TaskHandle::new(key, async move {
            match work.await {
                Ok(result) => result,
                Err(join) => Err(TaskFailure::new(node, format!("worker task aborted: {}", join))),
            }
        }))
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        debug!(address = %self.address, "Local cluster released");
        Ok(())
    }
}
