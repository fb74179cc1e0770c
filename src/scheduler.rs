//! Standalone scheduler process.
//!
//! Accepts client connections speaking the [wire](crate::adapters::wire)
//! protocol and runs their nodes on one shared [`LocalCluster`]. Each client
//! session gets its own catalog, built from the project configuration with
//! the session's environment, save version and overrides, so file-backed
//! datasets are the shared source of truth between client and scheduler.
//! Free outputs that only live in scheduler memory are sent back with the
//! node's `finished` reply.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::wire::{read_message, write_message, Payload, Reply, Request};
use crate::adapters::{ExecutionClient, LocalCluster, NodeTask, TaskFailure, TaskHandle};
use crate::config::ProjectConfig;
use crate::core::catalog::DataCatalog;
use crate::core::pipeline::Pipeline;
use crate::core::runner::SessionInfo;

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// Per-session state held for one connection
struct SessionState {
    info: Arc<SessionInfo>,
    pipeline: Pipeline,
    catalog: Arc<DataCatalog>,
    handles: HashMap<String, TaskHandle>,
}

/// A node accepted onto the cluster
struct Accepted {
    handle: TaskHandle,
    catalog: Arc<DataCatalog>,
    /// Free outputs of the pipeline held in memory, returned to the client
    returned: Vec<String>,
}

pub struct Scheduler {
    pipelines: Arc<BTreeMap<String, Pipeline>>,
    project_root: PathBuf,
    cluster: Arc<LocalCluster>,
}

impl Scheduler {
    pub fn new(pipelines: BTreeMap<String, Pipeline>, project_root: PathBuf, workers: usize) -> Self {
        Self {
            pipelines: Arc::new(pipelines),
            project_root,
            cluster: Arc::new(LocalCluster::new(workers)),
        }
    }

    /// Bind `address` (`host:port`, optionally prefixed `tcp://`)
    pub async fn bind(address: &str) -> Result<TcpListener> {
        let target = address.strip_prefix("tcp://").unwrap_or(address);
        TcpListener::bind(target)
            .await
            .with_context(|| format!("Failed to bind scheduler to {}", target))
    }

    /// Serve connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!(address = %local, "Scheduler listening");

        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = scheduler.handle_connection(stream).await {
                    warn!(peer = %peer, error = %e, "Client connection ended with error");
                }
            });
        }
    }

    #[instrument(skip_all, fields(peer = ?stream.peer_addr().ok()))]
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer: Writer = Arc::new(Mutex::new(write_half));
        let mut sessions: HashMap<Uuid, SessionState> = HashMap::new();
        let mut rejected: HashMap<Uuid, String> = HashMap::new();

        while let Some(request) = read_message::<_, Request>(&mut reader).await? {
            match request {
                Request::Open { session } => {
                    let session_id = session.session_id;
                    let reply = match self.open(session) {
                        Ok(state) => {
                            info!(%session_id, pipeline = %state.info.pipeline_name, "Session opened");
                            sessions.insert(session_id, state);
                            Reply::Opened { session_id }
                        }
                        Err(e) => {
                            let message = format!("{:#}", e);
                            error!(%session_id, error = %message, "Rejected session");
                            rejected.insert(session_id, message.clone());
                            Reply::Rejected { message }
                        }
                    };
                    send(&writer, &reply).await?;
                }

                Request::Submit {
                    session_id,
                    node,
                    deps,
                    is_async,
                } => {
                    let submitted = match sessions.get_mut(&session_id) {
                        Some(state) => self.submit(state, &node, &deps, is_async).await,
                        None => Err(TaskFailure::new(
                            &node,
                            match rejected.get(&session_id) {
                                Some(reason) => format!("session rejected: {}", reason),
                                None => format!("unknown session {}", session_id),
                            },
                        )),
                    };

                    match submitted {
                        Ok(accepted) => {
                            let writer = Arc::clone(&writer);
                            tokio::spawn(async move {
                                let node = accepted.handle.key().to_string();
                                let (failure, outputs) = match accepted.handle.wait().await {
                                    Ok(()) => match memory_outputs(&accepted.catalog, &accepted.returned).await {
                                        Ok(outputs) => (None, outputs),
                                        Err(e) => (Some(TaskFailure::new(&node, format!("{:#}", e))), BTreeMap::new()),
                                    },
                                    Err(failure) => (Some(failure), BTreeMap::new()),
                                };
                                let reply = Reply::Finished {
                                    session_id,
                                    node,
                                    failure,
                                    outputs,
                                };
                                if let Err(e) = send(&writer, &reply).await {
                                    warn!(%session_id, error = %e, "Failed to report finished node");
                                }
                            });
                        }
                        Err(failure) => {
                            let reply = Reply::Finished {
                                session_id,
                                node,
                                failure: Some(failure),
                                outputs: BTreeMap::new(),
                            };
                            send(&writer, &reply).await?;
                        }
                    }
                }

                Request::Close { session_id } => {
                    rejected.remove(&session_id);
                    if sessions.remove(&session_id).is_some() {
                        info!(%session_id, "Session closed");
                    }
                }
            }
        }

        debug!(sessions = sessions.len(), "Client disconnected");
        Ok(())
    }

    /// Build the catalog a session's nodes run against
    fn open(&self, session: SessionInfo) -> Result<SessionState> {
        let pipeline = self
            .pipelines
            .get(&session.pipeline_name)
            .with_context(|| format!("Unknown pipeline '{}'", session.pipeline_name))?
            .clone();

        let config = ProjectConfig::load(&self.project_root, Some(&session.env))?;
        let catalog = config
            .build_catalog(&session.save_version, &session.load_versions, &session.params)?
            .with_defaults(&pipeline)?;

        Ok(SessionState {
            info: Arc::new(session),
            pipeline,
            catalog: Arc::new(catalog),
            handles: HashMap::new(),
        })
    }

    async fn submit(
        &self,
        state: &mut SessionState,
        node: &str,
        deps: &[String],
        is_async: bool,
    ) -> Result<Accepted, TaskFailure> {
        let found = state
            .pipeline
            .node(node)
            .ok_or_else(|| TaskFailure::new(node, format!("unknown node in pipeline '{}'", state.info.pipeline_name)))?
            .clone();

        let mut handles = Vec::with_capacity(deps.len());
        for dep in deps {
            let handle = state
                .handles
                .get(dep)
                .ok_or_else(|| TaskFailure::new(node, format!("dependency '{}' was never submitted", dep)))?;
            handles.push(handle.clone());
        }

        let free_outputs = state.pipeline.outputs();
        let returned = found
            .outputs()
            .iter()
            .filter(|name| free_outputs.contains(name.as_str()) && state.catalog.is_memory(name))
            .cloned()
            .collect();

        let task = NodeTask {
            node: found,
            catalog: Arc::clone(&state.catalog),
            is_async,
            session: Arc::clone(&state.info),
        };
        let handle = self
            .cluster
            .submit(task, handles)
            .await
            .map_err(|e| TaskFailure::new(node, e.to_string()))?;

        debug!(session_id = %state.info.session_id, node, "Accepted node");
        state.handles.insert(node.to_string(), handle.clone());
        Ok(Accepted {
            handle,
            catalog: Arc::clone(&state.catalog),
            returned,
        })
    }
}

/// Encode the named memory datasets for a `finished` reply
async fn memory_outputs(catalog: &DataCatalog, names: &[String]) -> Result<BTreeMap<String, Payload>> {
    let mut outputs = BTreeMap::new();
    for name in names {
        let data = catalog.load(name).await?;
        let payload = Payload::encode(&data).with_context(|| format!("Failed to encode output '{}'", name))?;
        outputs.insert(name.clone(), payload);
    }
    Ok(outputs)
}

async fn send(writer: &Writer, reply: &Reply) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    write_message(&mut *writer, reply).await
}
