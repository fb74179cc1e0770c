//! Distributed-execution clients.
//!
//! A client accepts units of work together with the handles of the work they
//! depend on, and returns a handle of its own. Scheduling, worker placement
//! and dependency waiting all happen behind this interface.

pub mod local;
pub mod remote;
pub mod wire;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::catalog::DataCatalog;
use crate::core::node::{Node, NodeError};
use crate::core::runner::SessionInfo;

pub use local::LocalCluster;
pub use remote::RemoteClient;

/// Address selecting the in-process worker pool
pub const LOCAL_ADDRESS: &str = "local";

/// Outcome of one unit of work
pub type TaskResult = Result<(), TaskFailure>;

/// A failed unit of work, naming the node that raised
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("node '{node}' failed: {message}")]
pub struct TaskFailure {
    pub node: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl From<&NodeError> for TaskFailure {
    fn from(error: &NodeError) -> Self {
        Self::new(error.node(), error.to_string())
    }
}

/// Errors raised by the client itself, as opposed to the work it runs
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid scheduler address '{0}' (expected 'local', 'local://<workers>' or 'tcp://<host>:<port>')")]
    InvalidAddress(String),

    #[error("cannot reach scheduler at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {seconds}s connecting to scheduler at {address}")]
    Timeout { address: String, seconds: u64 },

    #[error("client is closed")]
    Closed,

    #[error("scheduler connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to a submitted unit of work.
///
/// Clones share one underlying future, so any number of dependents can wait
/// on the same handle.
#[derive(Clone)]
pub struct TaskHandle {
    key: String,
    future: Shared<BoxFuture<'static, TaskResult>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("resolved", &self.future.peek().is_some())
            .finish()
    }
}

impl TaskHandle {
    pub fn new<F>(key: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            key: key.into(),
            future: future.boxed().shared(),
        }
    }

    /// Node name this handle belongs to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the work to finish
    pub async fn wait(&self) -> TaskResult {
        self.future.clone().await
    }

    /// The result, if already resolved
    pub fn peek(&self) -> Option<TaskResult> {
        self.future.peek().cloned()
    }
}

/// Everything a worker needs to execute one node
#[derive(Clone)]
pub struct NodeTask {
    pub node: Node,
    pub catalog: Arc<DataCatalog>,
    pub is_async: bool,
    pub session: Arc<SessionInfo>,
}

/// A distributed-execution client
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Address this client is connected to
    fn address(&self) -> &str;

    /// Submit a node; it starts only after every dependency has resolved.
    ///
    /// If a dependency fails, the returned handle fails with the same
    /// failure.
    async fn submit(&self, task: NodeTask, deps: Vec<TaskHandle>) -> Result<TaskHandle, ClientError>;

    /// Release the connection; already-submitted work is not cancelled
    async fn close(&self) -> Result<(), ClientError>;
}

/// Connection parameters for the distributed runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// `local`, `local://<workers>` or `tcp://<host>:<port>`
    #[serde(default = "default_address")]
    pub address: String,

    /// Worker count for the in-process pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_address() -> String {
    LOCAL_ADDRESS.to_string()
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            workers: default_workers(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Connect to the execution backend named by `settings.address`
pub async fn connect(settings: &ClientSettings) -> Result<Arc<dyn ExecutionClient>, ClientError> {
    let address = settings.address.trim();

    if address == LOCAL_ADDRESS {
        return Ok(Arc::new(LocalCluster::new(settings.workers)));
    }

    if let Some(workers) = address.strip_prefix("local://") {
        let workers = workers
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ClientError::InvalidAddress(address.to_string()))?;
        return Ok(Arc::new(LocalCluster::new(workers)));
    }

    if address.starts_with("tcp://") {
        let client = RemoteClient::connect(address, settings.connect_timeout()).await?;
        return Ok(Arc::new(client));
    }

    Err(ClientError::InvalidAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_handle_resolves_once() {
        let handle = TaskHandle::new("a", async { Err(TaskFailure::new("a", "boom")) });
        let clone = handle.clone();

        assert!(handle.peek().is_none());
        assert_eq!(clone.wait().await, Err(TaskFailure::new("a", "boom")));
        assert_eq!(handle.peek(), Some(Err(TaskFailure::new("a", "boom"))));
    }

    #[tokio::test]
    async fn test_connect_local_addresses() {
        let client = connect(&ClientSettings {
            address: "local://3".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(client.address(), "local://3");

        let err = connect(&ClientSettings {
            address: "local://zero".to_string(),
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let err = connect(&ClientSettings {
            address: "http://127.0.0.1:8786".to_string(),
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::InvalidAddress(_)));
    }

    #[test]
    fn test_settings_defaults_from_yaml() {
        let settings: ClientSettings = serde_yaml::from_str("address: tcp://10.0.0.5:8786").unwrap();
        assert_eq!(settings.address, "tcp://10.0.0.5:8786");
        assert_eq!(settings.connect_timeout_seconds, 10);
        assert!(settings.workers >= 1);
    }
}
