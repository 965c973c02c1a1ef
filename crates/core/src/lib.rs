//! relay core data models.
//!
//! This crate defines the records shared by the scheduler, the chain
//! executor and the persistence layer.

#![warn(missing_docs)]

// Core identities
mod id;

// Task execution
mod task;
mod execution;
mod chain;

// Re-exports
pub use id::*;

pub use task::{
    Task, TaskConfig, TaskKind, TaskCategory, TaskOptions, TaskStatus, Priority,
    TaskFilter, TaskStats, ConfigError, ParseError,
};
pub use execution::{Execution, ExecutionFilter};
pub use chain::{ChainExecution, ChainResults, ChainStatus, NodeState, NodeStatus};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
