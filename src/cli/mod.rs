//! Command-line interface for glacier.
//!
//! Provides commands for running pipelines (sequentially or on an execution
//! client), serving a scheduler, and inspecting pipelines, the catalog,
//! configuration and past sessions.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::default_workers;
use crate::config::{self, ProjectConfig};
use crate::core::catalog::DataCatalog;
use crate::core::event_store::EventStore;
use crate::core::node::is_parameter;
use crate::domain::{Data, RunState};
use crate::pipelines::{register_pipelines, DEFAULT_PIPELINE};
use crate::scheduler::Scheduler;
use crate::session::{load_run, RunRequest, RunnerKind, Session};

/// glacier - Data pipelines with dependency-aware distributed execution
#[derive(Parser, Debug)]
#[command(name = "glacier")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Registered pipeline name
        #[arg(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: String,

        /// Configuration environment (conf/<env>)
        #[arg(short, long, env = "GLACIER_ENV")]
        env: Option<String>,

        /// Runner executing the nodes
        #[arg(short, long, value_enum, default_value_t = RunnerKind::Sequential)]
        runner: RunnerKind,

        /// Load and save node datasets concurrently
        #[arg(long = "async")]
        is_async: bool,

        /// Run only these nodes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Run these nodes and everything downstream (comma-separated)
        #[arg(long, value_delimiter = ',')]
        from_nodes: Vec<String>,

        /// Run these nodes and everything upstream (comma-separated)
        #[arg(long, value_delimiter = ',')]
        to_nodes: Vec<String>,

        /// Run only nodes with any of these tags (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Pin a versioned dataset: <name>:<version> (repeatable)
        #[arg(long = "load-version")]
        load_versions: Vec<String>,

        /// Override a parameter: <dotted.key>=<value> (repeatable)
        #[arg(long)]
        params: Vec<String>,

        /// Scheduler address for the distributed runner
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Serve a scheduler for distributed runs
    Scheduler {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:8786")]
        address: String,

        /// Worker slots (defaults to the number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List registered pipelines, or the nodes of one pipeline
    Pipelines {
        /// Pipeline to describe
        name: Option<String>,
    },

    /// List catalog entries
    Catalog {
        /// Configuration environment (conf/<env>)
        #[arg(short, long, env = "GLACIER_ENV")]
        env: Option<String>,

        /// Also show the datasets this pipeline would create in memory
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Check the status of a session
    Status {
        /// Session ID (UUID)
        session_id: String,
    },

    /// List recent sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config {
        /// Configuration environment (conf/<env>)
        #[arg(short, long, env = "GLACIER_ENV")]
        env: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                env,
                runner,
                is_async,
                nodes,
                from_nodes,
                to_nodes,
                tags,
                load_versions,
                params,
                address,
            } => {
                let request = RunRequest {
                    pipeline,
                    runner,
                    is_async,
                    nodes,
                    from_nodes,
                    to_nodes,
                    tags,
                    load_versions: parse_load_versions(&load_versions)?,
                    params: parse_params(&params)?,
                    address,
                };
                run_pipeline(env.as_deref(), request).await
            }
            Commands::Scheduler { address, workers } => serve_scheduler(&address, workers).await,
            Commands::Pipelines { name } => list_pipelines(name.as_deref()),
            Commands::Catalog { env, pipeline } => list_catalog(env.as_deref(), pipeline.as_deref()),
            Commands::Status { session_id } => show_status(&session_id).await,
            Commands::Sessions { limit } => list_sessions(limit).await,
            Commands::Config { env } => show_config(env.as_deref()),
        }
    }
}

/// Parse repeated `--load-version name:version` flags
fn parse_load_versions(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|entry| config::split_pair(entry, ':').context("Invalid --load-version"))
        .collect()
}

/// Parse repeated `--params key=value` flags into a parameter tree
fn parse_params(raw: &[String]) -> Result<Value> {
    let mut params = Value::Object(serde_json::Map::new());
    for entry in raw {
        let (key, value) = config::split_pair(entry, '=').context("Invalid --params")?;
        config::apply_param_override(&mut params, &key, &value)?;
    }
    Ok(params)
}

/// One-line summary of a node output
fn describe_data(data: &Data) -> String {
    match data {
        Data::Table(table) => format!("table, {} rows x {} columns", table.len(), table.num_columns()),
        Data::Object(value) => {
            let text = value.to_string();
            if text.chars().count() > 60 {
                format!("object, {}...", text.chars().take(60).collect::<String>())
            } else {
                format!("object, {}", text)
            }
        }
        Data::Image(image) => format!("image, {}x{}", image.width, image.height),
    }
}

/// Run a pipeline in a new session
async fn run_pipeline(env: Option<&str>, request: RunRequest) -> Result<()> {
    let config = ProjectConfig::discover(env)?;
    let pipelines = register_pipelines().context("Failed to register pipelines")?;

    let mut session = Session::create(config).await?;
    let session_id = session.id();

    match session.run(&pipelines, request).await {
        Ok(outcome) => {
            for (name, data) in &outcome.outputs {
                println!("{}: {}", name, describe_data(data));
            }
            eprintln!("\n[Session {} completed successfully]", session_id);
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[Session {} failed: {:#}]", session_id, e);
            std::process::exit(1);
        }
    }
}

/// Serve the scheduler for the project in the current directory
async fn serve_scheduler(address: &str, workers: Option<usize>) -> Result<()> {
    let config = ProjectConfig::discover(None)?;
    let pipelines = register_pipelines().context("Failed to register pipelines")?;
    let workers = workers.unwrap_or_else(default_workers);

    let listener = Scheduler::bind(address).await?;
    let scheduler = Arc::new(Scheduler::new(pipelines, config.root, workers));
    scheduler.serve(listener).await
}

/// List pipelines or describe one
fn list_pipelines(name: Option<&str>) -> Result<()> {
    let pipelines = register_pipelines().context("Failed to register pipelines")?;

    let Some(name) = name else {
        println!("{:<30} {:<8}", "PIPELINE", "NODES");
        println!("{}", "-".repeat(40));
        for (name, pipeline) in &pipelines {
            println!("{:<30} {:<8}", name, pipeline.len());
        }
        return Ok(());
    };

    let pipeline = pipelines
        .get(name)
        .with_context(|| format!("Pipeline '{}' not found", name))?;

    println!("Pipeline: {}", name);
    println!("Inputs:  {}", pipeline.inputs().into_iter().collect::<Vec<_>>().join(", "));
    println!("Outputs: {}", pipeline.outputs().into_iter().collect::<Vec<_>>().join(", "));
    println!("\nNodes (execution order):");
    for node in pipeline.topological_order() {
        println!("  {}", node.name());
        println!("    in:  {}", node.inputs().join(", "));
        println!("    out: {}", node.outputs().join(", "));
    }

    Ok(())
}

/// List the datasets declared for an environment
fn list_catalog(env: Option<&str>, pipeline: Option<&str>) -> Result<()> {
    let config = ProjectConfig::discover(env)?;
    let catalog = DataCatalog::from_config(&config.catalog, &config.root, None, HashMap::new())?;

    println!("{:<55} {}", "DATASET", "TYPE");
    println!("{}", "-".repeat(80));
    for (name, description) in catalog.list() {
        println!("{:<55} {}", name, description);
    }

    if let Some(pipeline_name) = pipeline {
        let pipelines = register_pipelines().context("Failed to register pipelines")?;
        let pipeline = pipelines
            .get(pipeline_name)
            .with_context(|| format!("Pipeline '{}' not found", pipeline_name))?;

        println!("\nDefault memory datasets for '{}':", pipeline_name);
        for name in pipeline.datasets() {
            if !catalog.contains(&name) && !is_parameter(&name) {
                println!("  {}", name);
            }
        }
    }

    Ok(())
}

fn state_label(state: &RunState) -> String {
    match state {
        RunState::Running => "running".to_string(),
        RunState::Completed => "completed".to_string(),
        RunState::Failed { .. } => "failed".to_string(),
    }
}

/// Show the status of a session
async fn show_status(session_id_str: &str) -> Result<()> {
    let session_id =
        Uuid::parse_str(session_id_str).with_context(|| format!("Invalid session ID: {}", session_id_str))?;

    let config = ProjectConfig::discover(None)?;
    let run = load_run(&config.sessions_dir(), session_id).await?;

    println!("Session ID: {}", run.session_id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {}", state_label(&run.state));
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nNode statuses:");
    for (node, status) in &run.node_statuses {
        println!("  {}: {:?}", node, status);
    }

    Ok(())
}

/// List recent sessions
async fn list_sessions(limit: usize) -> Result<()> {
    let config = ProjectConfig::discover(None)?;
    let sessions_dir = config.sessions_dir();

    let mut runs = Vec::new();
    for session_id in EventStore::list_sessions(&sessions_dir).await? {
        if let Ok(run) = load_run(&sessions_dir, session_id).await {
            runs.push(run);
        }
    }

    if runs.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<20} {:<12} {}", "SESSION ID", "PIPELINE", "STATE", "STARTED");
    println!("{}", "-".repeat(95));
    for run in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<20} {:<12} {}",
            run.session_id,
            run.pipeline_name,
            state_label(&run.state),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show the resolved configuration
fn show_config(env: Option<&str>) -> Result<()> {
    let config = ProjectConfig::discover(env)?;

    println!("Project root: {}", config.root.display());
    println!("Environment:  {}", config.env);
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", config.home.display());
    println!("  Sessions:            {}", config.sessions_dir().display());
    println!();
    println!("Configuration files:");
    if config.files.is_empty() {
        println!("  (none)");
    }
    for file in &config.files {
        println!("  {}", file.display());
    }
    println!();
    println!("Scheduler:");
    println!("  Address:         {}", config.scheduler.address);
    println!("  Workers:         {}", config.scheduler.workers);
    println!("  Connect timeout: {}s", config.scheduler.connect_timeout_seconds);
    println!();
    println!("Catalog entries: {}", config.catalog.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params_builds_tree() {
        let params = parse_params(&[
            "active_modelling_pipeline.model_options.map_width=720".to_string(),
            "active_modelling_pipeline.model_options.map_height=360".to_string(),
        ])
        .unwrap();
        assert_eq!(
            params,
            json!({"active_modelling_pipeline": {"model_options": {"map_width": 720, "map_height": 360}}})
        );
        assert!(parse_params(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_parse_load_versions() {
        let versions = parse_load_versions(&["scaler:2024-05-01T10.00.00.000Z".to_string()]).unwrap();
        assert_eq!(versions["scaler"], "2024-05-01T10.00.00.000Z");
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "glacier",
            "run",
            "--runner",
            "distributed",
            "--async",
            "--nodes",
            "load_glacier_node,load_state_node",
            "--params",
            "a=1",
            "--load-version",
            "x:v1",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                pipeline,
                runner,
                is_async,
                nodes,
                load_versions,
                ..
            } => {
                assert_eq!(pipeline, DEFAULT_PIPELINE);
                assert_eq!(runner, RunnerKind::Distributed);
                assert!(is_async);
                assert_eq!(nodes, vec!["load_glacier_node", "load_state_node"]);
                assert_eq!(load_versions, vec!["x:v1"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
