//! Reading the transaction log.
//!
//! - [`segment`] discovers which files make up the log at a version: the newest
//!   usable checkpoint plus the contiguous run of commits after it.
//! - [`replay`] folds actions into table state.
//!
//! This module owns [`LogError`] and the helpers that read single commits.

pub mod replay;
pub mod segment;

use snafu::{Backtrace, prelude::*};

use crate::{
    Version,
    actions::{self, Action, ActionParseError},
    config::ConfigError,
    log_path,
    protocol::ProtocolError,
    schema::SchemaError,
    storage::{LogStore, StorageError},
};

pub use replay::ReplayState;
pub use segment::{CheckpointFiles, LogSegment};

/// Errors raised while reading or reconstructing table state from the log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    /// Underlying storage error.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while reading log of {table_path}: {source}"))]
    Storage {
        /// Table root.
        table_path: String,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// No commit or checkpoint exists.
    #[snafu(display("No table exists at {table_path}"))]
    TableNotFound {
        /// Table root.
        table_path: String,
    },

    /// A commit version is missing from the log.
    #[snafu(display("Log of {table_path} is missing version {expected} (next found: {found})"))]
    VersionGap {
        /// Table root.
        table_path: String,
        /// Version that should exist.
        expected: Version,
        /// Version found instead.
        found: Version,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The requested version can no longer be reconstructed.
    #[snafu(display(
        "Version {version} of {table_path} is not available; earliest reconstructable version is {earliest}"
    ))]
    VersionNotAvailable {
        /// Table root.
        table_path: String,
        /// Requested version.
        version: Version,
        /// Earliest version that can be loaded.
        earliest: Version,
    },

    /// The requested version has not been committed yet.
    #[snafu(display("Version {version} of {table_path} does not exist; latest is {latest}"))]
    VersionAfterLatest {
        /// Table root.
        table_path: String,
        /// Requested version.
        version: Version,
        /// Latest committed version.
        latest: Version,
    },

    /// The requested timestamp precedes the earliest available commit.
    #[snafu(display(
        "Timestamp {timestamp} is before the earliest available commit of {table_path} ({earliest})"
    ))]
    TimestampBeforeFirstCommit {
        /// Table root.
        table_path: String,
        /// Requested timestamp in milliseconds.
        timestamp: i64,
        /// Timestamp of the earliest available commit.
        earliest: i64,
    },

    /// The requested timestamp is after the latest commit.
    #[snafu(display(
        "Timestamp {timestamp} is after the latest commit of {table_path} ({latest})"
    ))]
    TimestampAfterLatestCommit {
        /// Table root.
        table_path: String,
        /// Requested timestamp in milliseconds.
        timestamp: i64,
        /// Timestamp of the latest commit.
        latest: i64,
    },

    /// A commit file could not be decoded.
    #[snafu(display("Commit {version} of {table_path} is corrupt: {source}"))]
    CorruptCommit {
        /// Table root.
        table_path: String,
        /// Commit version.
        version: Version,
        /// Decoding error.
        source: ActionParseError,
    },

    /// A checkpoint could not be decoded.
    #[snafu(display("Checkpoint {version} of {table_path} is corrupt: {msg}"))]
    CorruptCheckpoint {
        /// Table root.
        table_path: String,
        /// Checkpoint version.
        version: Version,
        /// What is wrong.
        msg: String,
    },

    /// The log reaches a version without ever defining metadata.
    #[snafu(display("Table {table_path} has no metadata at version {version}"))]
    MissingMetadata {
        /// Table root.
        table_path: String,
        /// Version replayed.
        version: Version,
    },

    /// The log reaches a version without ever defining a protocol.
    #[snafu(display("Table {table_path} has no protocol at version {version}"))]
    MissingProtocol {
        /// Table root.
        table_path: String,
        /// Version replayed.
        version: Version,
    },

    /// The stored schema is invalid.
    #[snafu(display("Invalid schema in {table_path}: {source}"))]
    InvalidSchema {
        /// Table root.
        table_path: String,
        /// Schema error.
        source: SchemaError,
    },

    /// The stored protocol is invalid or not supported by this client.
    #[snafu(display("Protocol check failed for {table_path}: {source}"))]
    Protocol {
        /// Table root.
        table_path: String,
        /// Protocol error.
        source: ProtocolError,
    },

    /// A table property is malformed.
    #[snafu(display("Invalid configuration in {table_path}: {source}"))]
    Config {
        /// Table root.
        table_path: String,
        /// Configuration error.
        source: ConfigError,
    },

    /// Encoding a log file failed.
    #[snafu(display("Failed to encode log data for {table_path}: {msg}"))]
    Encode {
        /// Table root.
        table_path: String,
        /// What failed.
        msg: String,
    },
}

impl LogError {
    /// True when retrying the same read may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Storage { source, .. } if source.is_retryable())
    }
}

/// Read and decode the commit file of `version`.
pub async fn read_commit(store: &dyn LogStore, version: Version) -> Result<Vec<Action>, LogError> {
    let table_path = store.location().to_string();
    let bytes = store
        .read(&log_path::commit_path(version))
        .await
        .context(StorageSnafu {
            table_path: table_path.clone(),
        })?;
    actions::parse_actions(&bytes).context(CorruptCommitSnafu {
        table_path,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn read_commit_reports_corruption_with_version() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryLogStore::new("t");
        store
            .write(
                &log_path::commit_path(4),
                Bytes::from_static(b"{\"txn\":{\"appId\":\"a\",\"version\":1}}\n{oops\n"),
                false,
            )
            .await?;
        let err = read_commit(&store, 4).await.expect_err("corrupt commit");
        assert!(matches!(err, LogError::CorruptCommit { version: 4, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn missing_commit_is_storage_not_found() {
        let store = MemoryLogStore::new("t");
        let err = read_commit(&store, 0).await.expect_err("missing");
        match err {
            LogError::Storage { source, .. } => assert!(source.is_not_found()),
            other => panic!("unexpected error {other}"),
        }
    }
}
