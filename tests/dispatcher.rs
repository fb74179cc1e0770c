//! Dispatcher Integration Tests
//!
//! Tests for submission order, dependency handles and failure reporting of
//! the distributed runner, using a client that records what it is given.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use glacier::adapters::{ClientError, ExecutionClient, LocalCluster, NodeTask, TaskHandle};
use glacier::core::runner::{NoopObserver, SessionInfo};
use glacier::core::{DataCatalog, DistributedRunner, MemoryDataset, Node, Pipeline, Runner, RunnerError, SequentialRunner};
use glacier::domain::Data;
use serde_json::json;

/// Forwards to a local cluster and remembers every submission
struct RecordingClient {
    inner: LocalCluster,
    submitted: Mutex<Vec<(String, Vec<String>)>>,
    closed: AtomicBool,
}

impl RecordingClient {
    fn new() -> Self {
        Self {
            inner: LocalCluster::new(4),
            submitted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn submitted(&self) -> Vec<(String, Vec<String>)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionClient for RecordingClient {
    fn address(&self) -> &str {
        "recording"
    }

    async fn submit(&self, task: NodeTask, deps: Vec<TaskHandle>) -> Result<TaskHandle, ClientError> {
        let mut keys: Vec<String> = deps.iter().map(|d| d.key().to_string()).collect();
        keys.sort();
        self.submitted
            .lock()
            .unwrap()
            .push((task.node.name().to_string(), keys));
        self.inner.submit(task, deps).await
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.close().await
    }
}

fn add_one(inputs: Vec<Data>) -> anyhow::Result<Vec<Data>> {
    let sum: i64 = inputs.iter().filter_map(|d| d.as_object()?.as_i64()).sum();
    Ok(vec![Data::Object(json!(sum + 1))])
}

fn fail(_: Vec<Data>) -> anyhow::Result<Vec<Data>> {
    anyhow::bail!("melted")
}

fn catalog() -> DataCatalog {
    let mut catalog = DataCatalog::new();
    catalog.add("seed", Arc::new(MemoryDataset::with_data(Data::Object(json!(10)))));
    catalog
}

/// A feeds B and C; D joins them
fn diamond() -> Pipeline {
    Pipeline::new(vec![
        Node::new("d", add_one, &["b_out", "c_out"], &["d_out"]),
        Node::new("c", add_one, &["a_out"], &["c_out"]),
        Node::new("b", add_one, &["a_out"], &["b_out"]),
        Node::new("a", add_one, &["seed"], &["a_out"]),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_submits_in_topological_order_with_deps() {
    let client = Arc::new(RecordingClient::new());
    let runner = DistributedRunner::with_client(client.clone(), false);

    runner
        .run(&diamond(), &catalog(), &SessionInfo::new("diamond"), Arc::new(NoopObserver))
        .await
        .unwrap();

    let submitted = client.submitted();
    assert_eq!(submitted.len(), 4);

    // Every dependency was submitted before its dependent
    for (position, (_, deps)) in submitted.iter().enumerate() {
        for dep in deps {
            assert!(submitted[..position].iter().any(|(name, _)| name == dep));
        }
    }

    let deps_of = |node: &str| {
        submitted
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, deps)| deps.clone())
            .unwrap()
    };
    assert!(deps_of("a").is_empty());
    assert_eq!(deps_of("b"), vec!["a"]);
    assert_eq!(deps_of("c"), vec!["a"]);
    assert_eq!(deps_of("d"), vec!["b", "c"]);
    assert!(client.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failure_names_the_node() {
    let pipeline = Pipeline::new(vec![
        Node::new("a", add_one, &["seed"], &["a_out"]),
        Node::new("b", fail, &["a_out"], &["b_out"]),
        Node::new("c", add_one, &["a_out"], &["c_out"]),
    ])
    .unwrap();

    let client = Arc::new(RecordingClient::new());
    let runner = DistributedRunner::with_client(client.clone(), false);
    let err = runner
        .run(&pipeline, &catalog(), &SessionInfo::new("failing"), Arc::new(NoopObserver))
        .await
        .unwrap_err();

    assert_eq!(err.failed_node(), Some("b"));
    assert!(err.to_string().contains("melted"));
    assert_eq!(client.submitted().len(), 3);
    assert!(client.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_downstream_of_failure_reports_upstream_node() {
    let pipeline = Pipeline::new(vec![
        Node::new("a", fail, &["seed"], &["a_out"]),
        Node::new("b", add_one, &["a_out"], &["b_out"]),
    ])
    .unwrap();

    let runner = DistributedRunner::with_client(Arc::new(LocalCluster::new(2)), false);
    let err = runner
        .run(&pipeline, &catalog(), &SessionInfo::new("chain"), Arc::new(NoopObserver))
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Task(_)));
    assert_eq!(err.failed_node(), Some("a"));
}

#[tokio::test]
async fn test_distributed_matches_sequential() {
    let session = SessionInfo::new("diamond");

    let sequential = SequentialRunner::new(false)
        .run(&diamond(), &catalog(), &session, Arc::new(NoopObserver))
        .await
        .unwrap();

    let distributed = DistributedRunner::with_client(Arc::new(LocalCluster::new(3)), true)
        .run(&diamond(), &catalog(), &session, Arc::new(NoopObserver))
        .await
        .unwrap();

    // a=11, b=12, c=12, d=25
    assert_eq!(sequential.outputs.get("d_out"), Some(&Data::Object(json!(25))));
    assert_eq!(sequential.outputs, distributed.outputs);
}

#[tokio::test]
async fn test_missing_input_submits_nothing() {
    let client = Arc::new(RecordingClient::new());
    let runner = DistributedRunner::with_client(client.clone(), false);

    let err = runner
        .run(&diamond(), &DataCatalog::new(), &SessionInfo::new("empty"), Arc::new(NoopObserver))
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::MissingInputs(ref names) if names == &vec!["seed".to_string()]));
    assert!(client.submitted().is_empty());
}

#[tokio::test]
async fn test_intermediates_released_once_consumers_finish() {
    let a_out = Arc::new(MemoryDataset::new());
    let mut catalog = catalog();
    catalog.add("a_out", a_out.clone());

    let outcome = DistributedRunner::with_client(Arc::new(LocalCluster::new(2)), false)
        .run(&diamond(), &catalog, &SessionInfo::new("release"), Arc::new(NoopObserver))
        .await
        .unwrap();

    // b and c both read a_out; it is dropped only after both finished
    assert_eq!(outcome.outputs.get("d_out"), Some(&Data::Object(json!(25))));
    assert!(!catalog.exists("a_out").await.unwrap());
    assert!(catalog.exists("seed").await.unwrap());
}
