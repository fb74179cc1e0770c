//! glacier - Data pipelines with dependency-aware distributed execution
//!
//! Pipelines are graphs of nodes that exchange data only through a catalog
//! of named datasets. A run executes the graph either sequentially or by
//! handing every node to an execution client together with the handles of
//! the nodes it depends on.
//!
//! # Modules
//!
//! - `adapters`: Execution clients (in-process worker pool, remote scheduler)
//! - `core`: Graph builder, catalog, runners, session event store
//! - `domain`: Data structures (Data, Event, Run)
//! - `pipelines`: The project's registered pipelines
//! - `scheduler`: Standalone scheduler process
//! - `session`: One run with its id, save version and event log
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the default pipeline sequentially
//! glacier run
//!
//! # Run on a scheduler
//! glacier scheduler --address 127.0.0.1:8786 &
//! glacier run --runner distributed --address tcp://127.0.0.1:8786
//!
//! # Check session status
//! glacier status <session-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod pipelines;
pub mod scheduler;
pub mod session;

// Re-export main types at crate root for convenience
pub use adapters::{ClientError, ClientSettings, ExecutionClient, LocalCluster, RemoteClient, TaskFailure, TaskHandle};
pub use core::{DataCatalog, DistributedRunner, Node, Pipeline, Runner, RunnerError, SequentialRunner};
pub use domain::{Data, Event, EventType, Run, RunState, Table};
pub use session::{RunRequest, RunnerKind, Session};
