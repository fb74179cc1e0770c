//! Client for a standalone `glacier scheduler`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::wire::{read_message, write_message, Payload, Reply, Request};
use super::{ClientError, ExecutionClient, NodeTask, TaskFailure, TaskHandle};

/// What a `finished` reply resolves a waiting handle with
type Finished = Result<BTreeMap<String, Payload>, TaskFailure>;

type Pending = Arc<std::sync::Mutex<HashMap<(Uuid, String), oneshot::Sender<Finished>>>>;

/// TCP connection to a remote scheduler
pub struct RemoteClient {
    address: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Pending,
    opened: Mutex<HashSet<Uuid>>,
    reader: JoinHandle<()>,
}

impl RemoteClient {
    /// Connect to `tcp://<host>:<port>`, failing if the scheduler does not
    /// answer within `timeout`
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, ClientError> {
        let target = address
            .strip_prefix("tcp://")
            .ok_or_else(|| ClientError::InvalidAddress(address.to_string()))?;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ClientError::Timeout {
                    address: address.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        };
        stream.set_nodelay(true)?;
        info!(address, "Connected to scheduler");

        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::default();
        let reader = tokio::spawn(dispatch_replies(BufReader::new(read_half), Arc::clone(&pending)));

        Ok(Self {
            address: address.to_string(),
            writer: Mutex::new(Some(write_half)),
            pending,
            opened: Mutex::new(HashSet::new()),
            reader,
        })
    }

    async fn send(&self, request: &Request) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::Closed)?;
        write_message(writer, request).await?;
        Ok(())
    }

    /// Submissions still waiting for a `finished` reply
    pub fn pending_tasks(&self) -> usize {
        self.pending.lock().map_or(0, |map| map.len())
    }
}

/// Route `finished` replies to the handles waiting on them
async fn dispatch_replies(mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>, pending: Pending) {
    loop {
        let reply = match read_message::<_, Reply>(&mut reader).await {
            Ok(Some(reply)) => reply,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Dropping scheduler connection");
                break;
            }
        };

        match reply {
            Reply::Finished {
                session_id,
                node,
                failure,
                outputs,
            } => {
                let waiter = pending
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(&(session_id, node.clone())));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(match failure {
                            Some(failure) => Err(failure),
                            None => Ok(outputs),
                        });
                    }
                    None => debug!(node = %node, "Reply for unknown task"),
                }
            }
            Reply::Opened { session_id } => debug!(%session_id, "Scheduler opened session"),
            Reply::Rejected { message } => {
                warn!(message = %message, "Scheduler rejected request");
            }
        }
    }

    // Wake every waiter; their handles fail with a lost-connection error.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

#[async_trait]
impl ExecutionClient for RemoteClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn submit(&self, task: NodeTask, deps: Vec<TaskHandle>) -> Result<TaskHandle, ClientError> {
        let session_id = task.session.session_id;

        {
            let mut opened = self.opened.lock().await;
            if !opened.contains(&session_id) {
                self.send(&Request::Open {
                    session: (*task.session).clone(),
                })
                .await?;
                opened.insert(session_id);
            }
        }

        let node = task.node.name().to_string();
        let pending_key = (session_id, node.clone());
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.pending.lock() {
            map.insert(pending_key.clone(), tx);
        }

        let sent = self
            .send(&Request::Submit {
                session_id,
                node: node.clone(),
                deps: deps.iter().map(|d| d.key().to_string()).collect(),
                is_async: task.is_async,
            })
            .await;
        if let Err(e) = sent {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&pending_key);
            }
            return Err(e);
        }

        // Memory-only outputs come back with the reply and are stored in
        // the caller's catalog before dependents see the handle resolve.
        let catalog = Arc::clone(&task.catalog);
        let key = node.clone();
        Ok(TaskHandle::new(key, async move {
            let outputs = match rx.await {
                Ok(finished) => finished?,
                Err(_) => return Err(TaskFailure::new(node, "connection to scheduler lost")),
            };
            for (name, payload) in outputs {
                let data = payload
                    .decode()
                    .map_err(|e| TaskFailure::new(&node, format!("cannot decode output '{}': {}", name, e)))?;
                catalog
                    .save(&name, data)
                    .await
                    .map_err(|e| TaskFailure::new(&node, e.to_string()))?;
            }
            Ok(())
        }))
    }

    async fn close(&self) -> Result<(), ClientError> {
        let sessions: Vec<Uuid> = self.opened.lock().await.drain().collect();
        for session_id in sessions {
            if let Err(e) = self.send(&Request::Close { session_id }).await {
                warn!(%session_id, error = %e, "Failed to close scheduler session");
            }
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            writer.shutdown().await?;
        }
        debug!(address = %self.address, "Scheduler connection released");
        Ok(())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
