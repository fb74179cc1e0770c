//! Domain types for the glacier pipeline runner.
//!
//! This module contains the core data structures:
//! - Data: values exchanged between nodes through the catalog
//! - Events: immutable records of a session's progress
//! - Run: session state derived from events

pub mod data;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use data::{Data, ImageData, JoinKind, Table, TableError};
pub use events::{Event, EventType, NodeStatus};
pub use run::{Run, RunState};
