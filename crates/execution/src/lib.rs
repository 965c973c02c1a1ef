//! Execution layer - task scheduling, admission control and chains.

#![warn(missing_docs)]

pub mod chain;
pub mod concurrency;
pub mod config;
pub mod dependency;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod waiter;

pub use chain::{ChainDefinition, ChainExecutor, ChainNode, ChainSpec, NodeSpec};
pub use concurrency::{CategoryStats, ConcurrencyManager};
pub use config::{ChainConfig, ConcurrencyConfig, RelayConfig, SchedulerConfig, SkippedDependencyPolicy};
pub use dependency::{DependencyGraph, Resolution};
pub use error::{ExecutionError, Result};
pub use runner::{
    handler_fn, ApiClient, ExecutionContext, PluginHost, ProgressSink, RunnerRegistry, TaskHandler,
};
pub use scheduler::{TaskScheduler, TaskSchedulerBuilder};
pub use waiter::{CompletionWaiter, PollingWaiter};
