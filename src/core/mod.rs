//! Core pipeline machinery.
//!
//! This module contains:
//! - Node and Pipeline: the graph builder
//! - DataCatalog and datasets: named storage
//! - Runner: the sequential runner and shared node execution
//! - Dispatcher: dependency-aware submission to an execution client
//! - EventStore: append-only session log

pub mod catalog;
pub mod datasets;
pub mod dispatcher;
pub mod event_store;
pub mod node;
pub mod pipeline;
pub mod runner;

// Re-export commonly used types
pub use catalog::{CatalogError, DataCatalog, DatasetConfig, DatasetKind};
pub use datasets::{Dataset, DatasetError, FileDataset, FileFormat, MemoryDataset};
pub use dispatcher::DistributedRunner;
pub use event_store::EventStore;
pub use node::{Node, NodeError};
pub use pipeline::{Pipeline, PipelineError};
pub use runner::{RunObserver, RunOutcome, Runner, RunnerError, SequentialRunner, SessionInfo};
