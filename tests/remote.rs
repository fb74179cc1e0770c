//! Remote Scheduler Integration Tests
//!
//! Runs pipelines through a `Scheduler` listening on a loopback port.

mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use glacier::core::{Node, Pipeline};
use glacier::domain::{Data, RunState};
use glacier::pipelines::register_pipelines;
use glacier::scheduler::Scheduler;
use glacier::session::load_run;
use glacier::{RunRequest, RunnerKind, Session};
use tempfile::TempDir;

async fn start_scheduler(project: &TempDir, pipelines: BTreeMap<String, Pipeline>) -> SocketAddr {
    let listener = Scheduler::bind("tcp://127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let scheduler = Arc::new(Scheduler::new(pipelines, project.path().to_path_buf(), 2));
    tokio::spawn(scheduler.serve(listener));
    address
}

/// Nodes whose outputs the catalog does not declare
fn memory_only() -> Pipeline {
    Pipeline::new(vec![
        Node::new(
            "count_node",
            |inputs: Vec<Data>| {
                let rows = inputs[0].as_table().map_or(0, |t| t.len());
                Ok(vec![Data::Object(serde_json::json!(rows))])
            },
            &["glacier"],
            &["glacier_count"],
        ),
        Node::new(
            "ids_node",
            |inputs: Vec<Data>| {
                let glacier = inputs.into_iter().next().unwrap().into_table()?;
                Ok(vec![glacier.select(&["WGMS_ID", "NAME"])?.into()])
            },
            &["glacier"],
            &["glacier_ids"],
        ),
    ])
    .unwrap()
}

fn remote(pipeline: &str, address: SocketAddr) -> RunRequest {
    RunRequest {
        pipeline: pipeline.to_string(),
        runner: RunnerKind::Distributed,
        address: Some(format!("tcp://{}", address)),
        ..RunRequest::default()
    }
}

#[tokio::test]
async fn test_scheduler_runs_merge_data() {
    let project = common::project();
    let address = start_scheduler(&project, register_pipelines().unwrap()).await;

    let config = common::config(&project);
    let sessions_dir = config.sessions_dir();
    let mut session = Session::create(config).await.unwrap();
    session
        .run(&register_pipelines().unwrap(), remote("merge_data", address))
        .await
        .unwrap();

    // The scheduler wrote through its own catalog into the shared project
    assert!(project.path().join("data/03_primary/merged_data.parquet").is_file());

    let run = load_run(&sessions_dir, session.id()).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.node_statuses.len(), 5);
    assert!(run.is_node_completed("merge_data_node"));
}

#[tokio::test]
async fn test_memory_outputs_match_sequential_run() {
    let project = common::project();
    let mut pipelines = register_pipelines().unwrap();
    pipelines.insert("memory_only".to_string(), memory_only());
    let address = start_scheduler(&project, pipelines.clone()).await;

    let mut local = Session::create(common::config(&project)).await.unwrap();
    let sequential = local
        .run(
            &pipelines,
            RunRequest {
                pipeline: "memory_only".to_string(),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();

    let mut session = Session::create(common::config(&project)).await.unwrap();
    let distributed = session
        .run(&pipelines, remote("memory_only", address))
        .await
        .unwrap();

    assert_eq!(
        sequential.outputs.keys().collect::<Vec<_>>(),
        vec!["glacier_count", "glacier_ids"]
    );
    assert_eq!(sequential.outputs["glacier_count"], Data::Object(serde_json::json!(7)));
    assert_eq!(sequential.outputs, distributed.outputs);
}

#[tokio::test]
async fn test_pipeline_unknown_to_scheduler_fails() {
    let project = common::project();
    let address = start_scheduler(&project, register_pipelines().unwrap()).await;

    let mut pipelines = register_pipelines().unwrap();
    let extra = Pipeline::new(vec![Node::new(
        "count_node",
        |_: Vec<Data>| Ok(vec![Data::Object(serde_json::json!(1))]),
        &["glacier"],
        &["glacier_count"],
    )])
    .unwrap();
    pipelines.insert("extra".to_string(), extra);

    let mut session = Session::create(common::config(&project)).await.unwrap();
    let err = session.run(&pipelines, remote("extra", address)).await.unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("count_node"), "{}", message);
    assert!(message.contains("Unknown pipeline 'extra'"), "{}", message);
}

#[tokio::test]
async fn test_node_failure_on_scheduler_names_node() {
    let project = common::project();
    let address = start_scheduler(&project, register_pipelines().unwrap()).await;
    std::fs::write(project.path().join("data/01_raw/change.csv"), "WGMS_ID\n1\n").unwrap();

    let mut session = Session::create(common::config(&project)).await.unwrap();
    let err = session
        .run(&register_pipelines().unwrap(), remote("merge_data", address))
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("load_change_node"));
}

#[tokio::test]
async fn test_unreachable_scheduler_submits_nothing() {
    let project = common::project();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let config = common::config(&project);
    let sessions_dir = config.sessions_dir();
    let mut session = Session::create(config).await.unwrap();
    let err = session
        .run(&register_pipelines().unwrap(), remote("merge_data", address))
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("cannot reach scheduler"));
    let run = load_run(&sessions_dir, session.id()).await.unwrap();
    assert!(run.node_statuses.is_empty());
    assert!(!project.path().join("data/02_intermediate").exists());
}
