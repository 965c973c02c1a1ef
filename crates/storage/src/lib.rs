//! Storage abstraction and implementations for relay.
//!
//! This crate provides the durable record of tasks and executions that lets
//! a restarted process discover unfinished work. The JSON file backend is the
//! default; SQLite is available behind the `sqlite` feature.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory_storage;
#[cfg(feature = "json")]
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{Storage, StorageError, Result, retention_cutoff, TERMINAL_STATUSES, UNFINISHED_STATUSES};
pub use memory_storage::MemoryStorage;
#[cfg(feature = "json")]
pub use json_storage::JsonStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
