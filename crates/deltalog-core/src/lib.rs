//! Core engine for a Delta-style transaction log over append-only table
//! storage.
//!
//! The log is an ordered sequence of JSON commits under `_delta_log/`, each
//! holding the actions that took the table from one version to the next.
//! This crate provides:
//!
//! - The action model and its newline-delimited JSON encoding (`actions`).
//! - A storage abstraction with create-if-absent writes, plus local and
//!   in-memory backends (`storage`).
//! - Log discovery and replay into immutable snapshots (`log`, `snapshot`),
//!   with Parquet checkpoints to bound replay cost (`checkpoint`).
//! - Optimistic transactions with conflict detection, idempotent application
//!   transactions and row tracking (`transaction`).
//! - Protocol versioning and table feature gating (`protocol`,
//!   `table_features`), typed table properties (`config`), schemas and schema
//!   evolution (`schema`).
//! - Time travel and history (`history`) and expired log cleanup (`retention`).
//!
//! [`table::DeltaTable`] ties these together for most callers. The engine
//! never reads or writes data files; it only records which files make up the
//! table at each version.
#![warn(missing_docs)]

pub mod actions;
pub mod checkpoint;
pub mod config;
pub mod history;
pub mod log;
pub mod log_path;
pub mod predicate;
pub mod protocol;
pub mod retention;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod table_features;
pub mod transaction;

/// A table version: the sequence number of a commit.
pub type Version = u64;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub use actions::{
    Action, AddFile, CommitInfo, DomainMetadata, Metadata, Protocol, RemoveFile, SetTransaction,
};
pub use config::{CommitOptions, IsolationLevel, TableConfig};
pub use crate::log::LogError;
pub use snapshot::{Snapshot, SnapshotCache};
pub use storage::{LocalLogStore, LogStore, MemoryLogStore, StorageError};
pub use table::{DeltaTable, TableError};
pub use transaction::{CommitError, CommitOutcome, OptimisticTransaction, Operation};
