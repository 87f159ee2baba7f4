//! Table layer.
//!
//! [`DeltaTable`] is the user-facing entry point: it ties a log store, a
//! snapshot cache and default commit options together and exposes
//! create/open, snapshot access (latest, by version, by timestamp),
//! transactions, history and log maintenance.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use log::info;
use snafu::prelude::*;

use crate::{
    Version,
    actions::Metadata,
    checkpoint::{self, CheckpointMetadata},
    config::CommitOptions,
    history::{self, CommitEntry},
    log::LogError,
    retention,
    schema::{SchemaError, StructType},
    snapshot::{Snapshot, SnapshotCache},
    storage::{LocalLogStore, LogStore, TableLocation},
    transaction::{CommitError, CommitOutcome, MetadataUpdate, Operation, OptimisticTransaction},
};

/// Errors from table-level operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Reading the log failed.
    #[snafu(display("Transaction log error: {source}"))]
    Log {
        /// Underlying log error.
        #[snafu(source)]
        source: LogError,
    },

    /// A commit failed.
    #[snafu(display("Commit error: {source}"))]
    Commit {
        /// Underlying commit error.
        #[snafu(source)]
        source: CommitError,
    },

    /// `create` found an existing table.
    #[snafu(display("Table already exists at {table_path}"))]
    AlreadyExists {
        /// Table root.
        table_path: String,
    },

    /// The schema passed to `create` is invalid.
    #[snafu(display("Invalid schema for {table_path}: {source}"))]
    InvalidSchema {
        /// Table root.
        table_path: String,
        /// Underlying schema error.
        source: SchemaError,
    },
}

impl TableError {
    /// True for concurrent-modification conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TableError::Commit { source } if source.is_conflict())
    }
}

/// A table addressed through its log store.
#[derive(Debug, Clone)]
pub struct DeltaTable {
    store: Arc<dyn LogStore>,
    cache: Arc<SnapshotCache>,
    options: CommitOptions,
}

impl DeltaTable {
    /// Table served by `store`, with a private snapshot cache.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            cache: Arc::new(SnapshotCache::default()),
            options: CommitOptions::default(),
        }
    }

    /// Table on the local filesystem rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalLogStore::new(root)))
    }

    /// Share `cache` with other handles.
    pub fn with_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Use `options` for transactions started from this handle.
    pub fn with_options(mut self, options: CommitOptions) -> Self {
        self.options = options;
        self
    }

    /// Table root.
    pub fn location(&self) -> &TableLocation {
        self.store.location()
    }

    /// Underlying log store.
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Snapshot cache used by this handle.
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Create the table at version 0.
    ///
    /// Features required by `configuration` (row tracking, column mapping and
    /// so on) are enabled in the initial protocol.
    pub async fn create(
        &self,
        schema: &StructType,
        partition_columns: Vec<String>,
        configuration: BTreeMap<String, String>,
    ) -> Result<Arc<Snapshot>, TableError> {
        let table_path = self.location().to_string();
        let metadata = Metadata::try_new(schema, partition_columns.clone(), configuration)
            .context(InvalidSchemaSnafu {
                table_path: table_path.clone(),
            })?;
        let mut txn = OptimisticTransaction::for_new_table(
            self.store.clone(),
            self.options.clone(),
            self.cache.capabilities().clone(),
        )
        .with_cache(self.cache.clone());
        txn.update_metadata(metadata, MetadataUpdate::default())
            .context(CommitSnafu)?;

        let outcome = txn
            .commit(
                Vec::new(),
                Operation::CreateTable {
                    partition_by: partition_columns,
                },
            )
            .await;
        match outcome {
            Ok(CommitOutcome::Committed {
                post_commit_snapshot,
                ..
            }) => {
                info!("created table at {table_path}");
                Ok(post_commit_snapshot)
            }
            Ok(CommitOutcome::AlreadyCommitted { .. })
            | Err(CommitError::Conflict {
                attempted_version: 0,
                ..
            }) => AlreadyExistsSnafu { table_path }.fail(),
            Err(e) => Err(e).context(CommitSnafu),
        }
    }

    /// Handle for an existing table; fails if none exists.
    pub async fn open(store: Arc<dyn LogStore>) -> Result<Self, TableError> {
        let table = Self::new(store);
        table.snapshot().await?;
        Ok(table)
    }

    /// Latest snapshot, refreshed incrementally from the cache.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>, TableError> {
        self.cache
            .refresh(self.store.as_ref())
            .await
            .context(LogSnafu)
    }

    /// Snapshot at `version`.
    pub async fn snapshot_at(&self, version: Version) -> Result<Snapshot, TableError> {
        Snapshot::try_new(self.store.as_ref(), Some(version), self.cache.capabilities())
            .await
            .context(LogSnafu)
    }

    /// Snapshot of the latest version committed at or before `timestamp`.
    pub async fn snapshot_at_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Snapshot, TableError> {
        let version = history::version_at_timestamp(self.store.as_ref(), timestamp.timestamp_millis())
            .await
            .context(LogSnafu)?;
        self.snapshot_at(version).await
    }

    /// Start a transaction against the latest snapshot.
    pub async fn start_transaction(&self) -> Result<OptimisticTransaction, TableError> {
        let snapshot = self.snapshot().await?;
        let txn = OptimisticTransaction::new(
            self.store.clone(),
            snapshot,
            self.options.clone(),
            self.cache.capabilities().clone(),
        )
        .context(CommitSnafu)?;
        Ok(txn.with_cache(self.cache.clone()))
    }

    /// Commit provenance, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<CommitEntry>, TableError> {
        history::history(self.store.as_ref(), limit)
            .await
            .context(LogSnafu)
    }

    /// Write a checkpoint of the latest version.
    pub async fn checkpoint(&self) -> Result<CheckpointMetadata, TableError> {
        let snapshot = self.snapshot().await?;
        checkpoint::write_checkpoint(self.store.as_ref(), &snapshot)
            .await
            .context(LogSnafu)
    }

    /// Delete expired log files behind the newest old-enough checkpoint.
    pub async fn cleanup_expired_logs(&self) -> Result<usize, TableError> {
        let snapshot = self.snapshot().await?;
        retention::cleanup_expired_logs(self.store.as_ref(), &snapshot, crate::now_millis())
            .await
            .context(LogSnafu)
    }
}
