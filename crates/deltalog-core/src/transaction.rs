//! Optimistic transactions.
//!
//! An [`OptimisticTransaction`] is opened against a snapshot, records what it
//! reads, stages metadata/protocol changes and finally commits a list of
//! actions as the next version. The only mutual exclusion is the log store's
//! create-if-absent write of the commit file:
//!
//! 1. Attempt to create `commit(read_version + 1)`.
//! 2. If another writer got there first, read its commit and check it against
//!    this transaction's reads and writes ([`conflict`]). A clean check rebases
//!    the transaction to the next version; anything else fails the commit.
//! 3. If the write outcome is unknown (a timeout), re-read the version and
//!    recognize our own commit by its `txnId`.
//!
//! Attempts are bounded by [`CommitOptions::max_retries`]. After a successful
//! commit a checkpoint and expired-log cleanup may run; both are best effort.

pub mod conflict;
pub mod operation;
pub mod row_tracking;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    Version,
    actions::{self, Action, AddFile, CommitInfo, Metadata, Protocol},
    checkpoint,
    config::{
        ColumnMappingMode, CommitOptions, ConfigError, TableConfig, keys,
    },
    log::{LogError, ReplayState, read_commit},
    log_path,
    predicate::{PartitionColumns, Predicate},
    protocol::{ClientCapabilities, ProtocolError},
    retention,
    schema::{
        SchemaError, StructType,
        column_mapping::assign_column_mapping,
        compat::{SchemaCompatibilityError, SchemaEvolution, ensure_compatible},
    },
    snapshot::{Snapshot, SnapshotCache},
    storage::{LogStore, StorageError},
    table_features::{DELETION_VECTORS, ROW_TRACKING},
};

pub use conflict::{ConflictKind, ReadFootprint, WinningCommit};
pub use operation::{Operation, WriteMode};
pub use row_tracking::RowTrackingError;

use conflict::ConflictChecker;

/// Errors raised by transactions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// A concurrent commit conflicts with this transaction.
    #[snafu(display(
        "Commit to {table_path} at version {attempted_version} conflicts with {winning_operation} committed at version {winning_version}: {kind}"
    ))]
    Conflict {
        /// Table root.
        table_path: String,
        /// Version this transaction attempted.
        attempted_version: Version,
        /// Version of the conflicting commit.
        winning_version: Version,
        /// Operation of the conflicting commit.
        winning_operation: String,
        /// What overlapped.
        kind: ConflictKind,
    },

    /// The commit lost the race too many times.
    #[snafu(display(
        "Gave up committing to {table_path} after {attempts} attempts (last tried version {last_version})"
    ))]
    MaxRetriesExceeded {
        /// Table root.
        table_path: String,
        /// Attempts made.
        attempts: u32,
        /// Last version attempted.
        last_version: Version,
    },

    /// Protocol check or upgrade failed.
    #[snafu(display("Protocol error on {table_path}: {source}"))]
    Protocol {
        /// Table root.
        table_path: String,
        /// Underlying protocol error.
        source: ProtocolError,
    },

    /// A table property is malformed.
    #[snafu(display("Configuration error on {table_path}: {source}"))]
    Config {
        /// Table root.
        table_path: String,
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// Reading the log failed.
    #[snafu(display("{source}"))]
    Log {
        /// Underlying log error; it names the table.
        source: LogError,
    },

    /// Writing the commit failed with an error other than a lost race.
    #[snafu(display("Storage error committing to {table_path}: {source}"))]
    Storage {
        /// Table root.
        table_path: String,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The staged schema is invalid.
    #[snafu(display("Invalid schema for {table_path}: {source}"))]
    InvalidSchema {
        /// Table root.
        table_path: String,
        /// Underlying schema error.
        source: SchemaError,
    },

    /// The staged schema is incompatible with the table schema.
    #[snafu(display("Incompatible schema change on {table_path}: {source}"))]
    SchemaMismatch {
        /// Table root.
        table_path: String,
        /// Underlying compatibility error.
        source: SchemaCompatibilityError,
    },

    /// The staged actions are not valid for this table.
    #[snafu(display("Invalid commit to {table_path}: {detail}"))]
    InvalidAction {
        /// Table root.
        table_path: String,
        /// What is wrong.
        detail: String,
    },

    /// The transaction is not in a state that allows the call.
    #[snafu(display("Transaction on {table_path} is {state}"))]
    InvalidState {
        /// Table root.
        table_path: String,
        /// Current state.
        state: TransactionState,
    },

    /// The table is append-only and the commit removes data.
    #[snafu(display("Table {table_path} is append-only; cannot remove {path}"))]
    AppendOnlyViolation {
        /// Table root.
        table_path: String,
        /// File the commit tried to remove.
        path: String,
    },

    /// Row ids could not be assigned.
    #[snafu(display("Row tracking failed on {table_path}: {source}"))]
    RowTracking {
        /// Table root.
        table_path: String,
        /// Underlying row tracking error.
        source: RowTrackingError,
    },

    /// The commit payload could not be encoded.
    #[snafu(display("Failed to encode commit for {table_path}: {source}"))]
    Serialize {
        /// Table root.
        table_path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// The file writer failed.
    #[snafu(display("Writing data files for {table_path} failed: {source}"))]
    FileWriter {
        /// Table root.
        table_path: String,
        /// Error returned by the writer.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CommitError {
    /// True for concurrent-modification conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CommitError::Conflict { .. })
    }

    /// True when starting a fresh transaction and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommitError::Conflict { .. } | CommitError::MaxRetriesExceeded { .. } => true,
            CommitError::Storage { source, .. } => source.is_retryable(),
            CommitError::Log { source } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Reading and staging.
    Active,
    /// A commit call is in flight.
    Committing,
    /// Committed (or found already committed).
    Committed,
    /// The commit failed; the transaction cannot be reused.
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::Active => "active",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "already committed",
            TransactionState::Failed => "failed",
        })
    }
}

/// Result of a successful commit call.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// A new version was written.
    Committed {
        /// Version written.
        version: Version,
        /// Table state right after the commit.
        post_commit_snapshot: Arc<Snapshot>,
        /// Write attempts made, including the successful one.
        attempts: u32,
    },
    /// The application's `txn` version was already recorded; nothing was written.
    AlreadyCommitted {
        /// Application id.
        app_id: String,
        /// Version the caller tried to commit.
        version: i64,
    },
}

impl CommitOutcome {
    /// Committed version, if a new one was written.
    pub fn version(&self) -> Option<Version> {
        match self {
            CommitOutcome::Committed { version, .. } => Some(*version),
            CommitOutcome::AlreadyCommitted { .. } => None,
        }
    }
}

/// How [`OptimisticTransaction::update_metadata`] may change the schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    /// Allow additive schema changes.
    pub merge_schema: bool,
    /// Replace the schema and partitioning wholesale.
    pub overwrite_schema: bool,
}

/// What a [`FileWriter`] needs to know about the table.
#[derive(Debug, Clone)]
pub struct WriteContext {
    /// Table root.
    pub table_path: String,
    /// Table schema.
    pub schema: Arc<StructType>,
    /// Partition columns.
    pub partition_columns: Vec<String>,
    /// Table properties.
    pub configuration: BTreeMap<String, String>,
}

/// Writes data files and describes them as `add` actions.
///
/// The engine never touches data bytes; implementations live with the
/// execution layer.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Input the writer consumes.
    type Data: Send;
    /// Writer failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write `data` and return one `add` per file produced.
    async fn write_files(
        &self,
        context: &WriteContext,
        data: Self::Data,
    ) -> Result<Vec<AddFile>, Self::Error>;
}

enum AttemptOutcome {
    Written,
    Taken(Vec<Action>),
    Vacant,
}

/// A unit of work against one table version.
#[derive(Debug)]
pub struct OptimisticTransaction {
    store: Arc<dyn LogStore>,
    table_path: String,
    snapshot: Option<Arc<Snapshot>>,
    options: CommitOptions,
    capabilities: ClientCapabilities,
    cache: Option<Arc<SnapshotCache>>,
    new_metadata: Option<Metadata>,
    new_protocol: Option<Protocol>,
    footprint: ReadFootprint,
    state: TransactionState,
}

impl OptimisticTransaction {
    /// Open a transaction reading `snapshot`.
    pub fn new(
        store: Arc<dyn LogStore>,
        snapshot: Arc<Snapshot>,
        options: CommitOptions,
        capabilities: ClientCapabilities,
    ) -> Result<Self, CommitError> {
        let table_path = snapshot.table_path().to_string();
        capabilities
            .ensure_can_write(snapshot.protocol())
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;
        Ok(Self {
            store,
            table_path,
            snapshot: Some(snapshot),
            options,
            capabilities,
            cache: None,
            new_metadata: None,
            new_protocol: None,
            footprint: ReadFootprint::default(),
            state: TransactionState::Active,
        })
    }

    /// Open a transaction that creates the table at version 0.
    ///
    /// It must stage metadata before committing.
    pub fn for_new_table(
        store: Arc<dyn LogStore>,
        options: CommitOptions,
        capabilities: ClientCapabilities,
    ) -> Self {
        let table_path = store.location().to_string();
        Self {
            store,
            table_path,
            snapshot: None,
            options,
            capabilities,
            cache: None,
            new_metadata: None,
            new_protocol: None,
            footprint: ReadFootprint::default(),
            state: TransactionState::Active,
        }
    }

    /// Publish the post-commit snapshot to `cache`.
    pub fn with_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Version read, or `None` for a new table.
    pub fn read_version(&self) -> Option<Version> {
        self.snapshot.as_ref().map(|s| s.version())
    }

    /// Snapshot the transaction reads.
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// What the transaction has read so far.
    pub fn footprint(&self) -> &ReadFootprint {
        &self.footprint
    }

    /// Staged metadata, else the snapshot's.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.new_metadata
            .as_ref()
            .or_else(|| self.snapshot.as_ref().map(|s| s.metadata()))
    }

    /// Staged protocol, else the snapshot's.
    pub fn protocol(&self) -> Option<&Protocol> {
        self.new_protocol
            .as_ref()
            .or_else(|| self.snapshot.as_ref().map(|s| s.protocol()))
    }

    fn base_protocol(&self) -> Protocol {
        self.snapshot
            .as_ref()
            .map(|s| s.protocol().clone())
            .unwrap_or_default()
    }

    fn ensure_active(&self) -> Result<(), CommitError> {
        ensure!(
            self.state == TransactionState::Active,
            InvalidStateSnafu {
                table_path: self.table_path.clone(),
                state: self.state,
            }
        );
        Ok(())
    }

    /// Stage new metadata.
    ///
    /// The schema is validated against the table schema according to
    /// `update`; column mapping ids are assigned when the mapping mode asks for
    /// them; and any table feature the new configuration needs is added to the
    /// staged protocol so both land in the same commit.
    pub fn update_metadata(
        &mut self,
        metadata: Metadata,
        update: MetadataUpdate,
    ) -> Result<(), CommitError> {
        self.ensure_active()?;
        let table_path = self.table_path.clone();
        let mut metadata = metadata;

        let schema = metadata.schema().context(InvalidSchemaSnafu {
            table_path: table_path.clone(),
        })?;
        schema.validate().context(InvalidSchemaSnafu {
            table_path: table_path.clone(),
        })?;
        schema
            .validate_partition_columns(&metadata.partition_columns)
            .context(InvalidSchemaSnafu {
                table_path: table_path.clone(),
            })?;
        let config = TableConfig::new(&metadata.configuration);
        config.validate().context(ConfigSnafu {
            table_path: table_path.clone(),
        })?;

        let existing = self.snapshot.as_ref().map(|s| (s.metadata().clone(), s.schema().clone()));
        if let Some((current, current_schema)) = &existing {
            let mode = if update.overwrite_schema {
                SchemaEvolution::Overwrite
            } else if update.merge_schema {
                SchemaEvolution::Merge
            } else {
                SchemaEvolution::Exact
            };
            let widening = config.type_widening_enabled().context(ConfigSnafu {
                table_path: table_path.clone(),
            })?;
            ensure_compatible(current_schema, &schema, mode, widening).context(
                SchemaMismatchSnafu {
                    table_path: table_path.clone(),
                },
            )?;
            ensure!(
                update.overwrite_schema || metadata.partition_columns == current.partition_columns,
                InvalidActionSnafu {
                    table_path: table_path.clone(),
                    detail: "partition columns can only change when overwriting the schema",
                }
            );
            metadata.id = current.id.clone();
            metadata.created_time = current.created_time;
        }

        let mapping = config.column_mapping_mode().context(ConfigSnafu {
            table_path: table_path.clone(),
        })?;
        if mapping != ColumnMappingMode::None {
            let max_id = config.column_mapping_max_column_id().context(ConfigSnafu {
                table_path: table_path.clone(),
            })?;
            let previous = existing.as_ref().map(|(_, s)| s.as_ref());
            let (mapped, max_id) = assign_column_mapping(&schema, previous, max_id);
            metadata = metadata
                .with_schema(&mapped)
                .context(InvalidSchemaSnafu {
                    table_path: table_path.clone(),
                })?
                .with_property(keys::COLUMN_MAPPING_MAX_COLUMN_ID, max_id.to_string());
        }

        let staged = self.new_protocol.clone().unwrap_or_else(|| self.base_protocol());
        let protocol = staged.upgrade_for_metadata(&metadata).unwrap_or(staged);
        self.capabilities
            .ensure_can_write(&protocol)
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;
        if protocol != self.base_protocol() || self.snapshot.is_none() {
            debug!("staging protocol {protocol} for {table_path}");
            self.new_protocol = Some(protocol);
        }
        self.new_metadata = Some(metadata);
        Ok(())
    }

    /// Stage an explicit protocol upgrade. Downgrades are rejected.
    pub fn update_protocol(&mut self, protocol: Protocol) -> Result<(), CommitError> {
        self.ensure_active()?;
        let table_path = self.table_path.clone();
        protocol.validate().context(ProtocolSnafu {
            table_path: table_path.clone(),
        })?;
        let base = self.new_protocol.clone().unwrap_or_else(|| self.base_protocol());
        base.ensure_not_downgraded_by(&protocol)
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;
        let merged = base.merge(&protocol);
        self.capabilities
            .ensure_can_write(&merged)
            .context(ProtocolSnafu { table_path })?;
        self.new_protocol = Some(merged);
        Ok(())
    }

    /// Live files that may match `predicate` (all files when `None`).
    ///
    /// The predicate is recorded: concurrent commits touching files it could
    /// match will conflict with this transaction.
    pub fn filter_files(&mut self, predicate: Option<&Predicate>) -> Vec<AddFile> {
        match predicate {
            Some(p) => self.footprint.predicates.push(p.clone()),
            None => self.footprint.whole_table = true,
        }
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        let files: Vec<AddFile> = match predicate {
            Some(p) => snapshot.files_matching(p).cloned().collect(),
            None => snapshot.all_files().cloned().collect(),
        };
        self.footprint
            .files
            .extend(files.iter().map(|f| f.path.clone()));
        files
    }

    /// Record a dependency on the entire table without listing files.
    pub fn read_whole_table(&mut self) {
        self.footprint.whole_table = true;
    }

    /// Last version committed by `app_id`. The lookup is recorded so a
    /// concurrent commit by the same application conflicts.
    pub fn txn_version(&mut self, app_id: &str) -> Option<i64> {
        self.footprint.app_ids.insert(app_id.to_string());
        self.snapshot
            .as_ref()
            .and_then(|s| s.app_transaction_version(app_id))
    }

    /// Context handed to file writers.
    pub fn write_context(&self) -> Option<WriteContext> {
        let metadata = self.metadata()?;
        let schema = metadata.schema().ok()?;
        Some(WriteContext {
            table_path: self.table_path.clone(),
            schema,
            partition_columns: metadata.partition_columns.clone(),
            configuration: metadata.configuration.clone(),
        })
    }

    /// Write `data` through `writer` and return the `add` actions to commit.
    ///
    /// Every returned file must carry a value for each partition column.
    pub async fn write_files<W: FileWriter>(
        &self,
        writer: &W,
        data: W::Data,
    ) -> Result<Vec<AddFile>, CommitError> {
        self.ensure_active()?;
        let context = self.write_context().context(InvalidActionSnafu {
            table_path: self.table_path.clone(),
            detail: "no valid metadata to write against",
        })?;
        let adds = writer
            .write_files(&context, data)
            .await
            .map_err(|e| CommitError::FileWriter {
                table_path: self.table_path.clone(),
                source: Box::new(e),
            })?;
        for add in &adds {
            let complete = context.partition_columns.len() == add.partition_values.len()
                && context
                    .partition_columns
                    .iter()
                    .all(|c| add.partition_values.contains_key(c));
            ensure!(
                complete,
                InvalidActionSnafu {
                    table_path: self.table_path.clone(),
                    detail: format!(
                        "file {} has partition values for {:?}, expected {:?}",
                        add.path,
                        add.partition_values.keys().collect::<Vec<_>>(),
                        context.partition_columns
                    ),
                }
            );
        }
        Ok(adds)
    }

    /// Commit `actions` as the next version.
    ///
    /// Metadata and protocol changes must be staged with
    /// [`update_metadata`](Self::update_metadata) /
    /// [`update_protocol`](Self::update_protocol), not passed here.
    pub async fn commit(
        &mut self,
        actions: Vec<Action>,
        operation: Operation,
    ) -> Result<CommitOutcome, CommitError> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;
        let result = self.try_commit(actions, operation).await;
        self.state = match result {
            Ok(_) => TransactionState::Committed,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    async fn try_commit(
        &mut self,
        actions: Vec<Action>,
        operation: Operation,
    ) -> Result<CommitOutcome, CommitError> {
        let table_path = self.table_path.clone();
        self.validate_actions(&actions)?;

        if let Some(snapshot) = &self.snapshot {
            for action in &actions {
                if let Action::Txn(txn) = action {
                    if snapshot
                        .app_transaction_version(&txn.app_id)
                        .is_some_and(|v| v >= txn.version)
                    {
                        info!(
                            "{table_path}: application {} already committed version {}; skipping",
                            txn.app_id, txn.version
                        );
                        return Ok(CommitOutcome::AlreadyCommitted {
                            app_id: txn.app_id.clone(),
                            version: txn.version,
                        });
                    }
                }
            }
        }

        let metadata = self.metadata().cloned().context(InvalidActionSnafu {
            table_path: table_path.clone(),
            detail: "a new table needs metadata",
        })?;
        let protocol = self.protocol().cloned().unwrap_or_default();
        protocol
            .ensure_supports_metadata(&metadata)
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;
        self.base_protocol()
            .ensure_not_downgraded_by(&protocol)
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;
        self.capabilities
            .ensure_can_write(&protocol)
            .context(ProtocolSnafu {
                table_path: table_path.clone(),
            })?;

        let config = TableConfig::new(&metadata.configuration);
        if config.append_only().context(ConfigSnafu {
            table_path: table_path.clone(),
        })? {
            if let Some(path) = actions.iter().find_map(|a| match a {
                Action::Remove(r) if r.data_change => Some(r.path.clone()),
                _ => None,
            }) {
                return AppendOnlyViolationSnafu { table_path, path }.fail();
            }
        }
        let uses_dv = actions.iter().any(|a| match a {
            Action::Add(add) => add.deletion_vector.is_some(),
            Action::Remove(r) => r.deletion_vector.is_some(),
            _ => false,
        });
        ensure!(
            !uses_dv || protocol.is_feature_supported(&DELETION_VECTORS),
            InvalidActionSnafu {
                table_path: table_path.clone(),
                detail: "deletion vectors require the deletionVectors table feature",
            }
        );

        let isolation = match self.options.isolation_level {
            Some(level) => level,
            None => config.isolation_level().context(ConfigSnafu {
                table_path: table_path.clone(),
            })?,
        };
        let ict_enabled = config.in_commit_timestamps_enabled().context(ConfigSnafu {
            table_path: table_path.clone(),
        })?;
        let row_tracking = protocol.is_feature_supported(&ROW_TRACKING);
        let blind_append = self.footprint.is_empty()
            && self.new_metadata.is_none()
            && actions
                .iter()
                .all(|a| matches!(a, Action::Add(add) if add.data_change) || matches!(a, Action::Txn(_)));
        let table_schema = metadata.schema().context(InvalidSchemaSnafu {
            table_path: table_path.clone(),
        })?;
        let partition_columns = PartitionColumns::new(&table_schema, &metadata.partition_columns);

        let txn_id = uuid::Uuid::new_v4().to_string();
        let mut current = self.snapshot.clone();
        let mut version = self.read_version().map_or(0, |v| v + 1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut batch = actions.clone();
            let mut prefix = Vec::with_capacity(4);

            let now = crate::now_millis();
            let in_commit_timestamp = ict_enabled.then(|| {
                current
                    .as_ref()
                    .map_or(now, |s| now.max(s.timestamp() + 1))
            });
            prefix.push(Action::CommitInfo(CommitInfo {
                in_commit_timestamp,
                timestamp: Some(now),
                operation: Some(operation.name().to_string()),
                operation_parameters: Some(operation.parameters()),
                read_version: self.read_version().map(|v| v as i64),
                isolation_level: Some(isolation.as_str().to_string()),
                is_blind_append: Some(blind_append),
                user_metadata: self.options.user_metadata.clone(),
                engine_info: Some(self.options.engine_info.clone()),
                txn_id: Some(txn_id.clone()),
                ..CommitInfo::default()
            }));
            if let Some(p) = &self.new_protocol {
                prefix.push(Action::Protocol(p.clone()));
            }
            if let Some(m) = &self.new_metadata {
                prefix.push(Action::Metadata(m.clone()));
            }
            if row_tracking {
                let mark = row_tracking::high_water_mark(current.as_deref()).context(
                    RowTrackingSnafu {
                        table_path: table_path.clone(),
                    },
                )?;
                if let Some(domain) = row_tracking::assign_row_ids(&mut batch, mark, version)
                    .context(RowTrackingSnafu {
                        table_path: table_path.clone(),
                    })?
                {
                    batch.push(Action::DomainMetadata(domain));
                }
            }
            prefix.extend(batch);
            let committed = prefix;

            debug!("{table_path}: attempt {attempts} at version {version}");
            let outcome = self.attempt(version, &committed).await?;
            match outcome {
                AttemptOutcome::Written => {
                    info!("{table_path}: committed version {version} after {attempts} attempt(s)");
                    let snapshot = self.post_commit(current.as_deref(), version, committed).await?;
                    return Ok(CommitOutcome::Committed {
                        version,
                        post_commit_snapshot: snapshot,
                        attempts,
                    });
                }
                AttemptOutcome::Taken(winner_actions) => {
                    let winner = WinningCommit::new(version, winner_actions);
                    if winner.txn_id() == Some(txn_id.as_str()) {
                        info!("{table_path}: version {version} already holds this transaction");
                        let snapshot = self.post_commit(current.as_deref(), version, winner.actions).await?;
                        return Ok(CommitOutcome::Committed {
                            version,
                            post_commit_snapshot: snapshot,
                            attempts,
                        });
                    }

                    let checker = ConflictChecker {
                        partition_columns: &partition_columns,
                        isolation,
                        footprint: &self.footprint,
                        staged: &actions,
                        metadata_changed: self.new_metadata.is_some(),
                    };
                    if let Err(kind) = checker.check(&winner) {
                        warn!(
                            "{table_path}: version {version} taken by {}; {kind}",
                            winner.operation()
                        );
                        return ConflictSnafu {
                            table_path,
                            attempted_version: version,
                            winning_version: version,
                            winning_operation: winner.operation().to_string(),
                            kind,
                        }
                        .fail();
                    }

                    current = Some(Arc::new(self.roll_forward(current.as_deref(), version, winner.actions)?));
                    version += 1;
                    debug!("{table_path}: rebased onto version {}", version - 1);
                }
                AttemptOutcome::Vacant => {
                    debug!("{table_path}: ambiguous write of version {version} did not land; retrying");
                }
            }

            ensure!(
                attempts <= self.options.max_retries,
                MaxRetriesExceededSnafu {
                    table_path,
                    attempts,
                    last_version: version,
                }
            );
        }
    }

    fn validate_actions(&self, actions: &[Action]) -> Result<(), CommitError> {
        let mut apps = std::collections::BTreeSet::new();
        for action in actions {
            let problem = match action {
                Action::Metadata(_) => Some("stage metadata with update_metadata".to_string()),
                Action::Protocol(_) => Some("stage protocol changes with update_protocol".to_string()),
                Action::CommitInfo(_) => Some("commitInfo is written by the transaction".to_string()),
                Action::Add(add) if add.path.is_empty() => Some("add with empty path".to_string()),
                Action::Remove(r) if r.path.is_empty() => Some("remove with empty path".to_string()),
                Action::Txn(t) if !apps.insert(t.app_id.as_str()) => {
                    Some(format!("more than one txn for application {}", t.app_id))
                }
                _ => None,
            };
            if let Some(detail) = problem {
                return InvalidActionSnafu {
                    table_path: self.table_path.clone(),
                    detail,
                }
                .fail();
            }
        }
        Ok(())
    }

    async fn attempt(&self, version: Version, committed: &[Action]) -> Result<AttemptOutcome, CommitError> {
        let body = actions::serialize_actions(committed).context(SerializeSnafu {
            table_path: self.table_path.clone(),
        })?;
        let path = log_path::commit_path(version);
        match self.store.write(&path, Bytes::from(body), false).await {
            Ok(()) => Ok(AttemptOutcome::Written),
            Err(e) if e.is_already_exists() => {
                let winner = read_commit(self.store.as_ref(), version)
                    .await
                    .context(LogSnafu)?;
                Ok(AttemptOutcome::Taken(winner))
            }
            Err(StorageError::Ambiguous { .. }) => {
                warn!("{}: outcome of writing version {version} unknown; checking", self.table_path);
                match read_commit(self.store.as_ref(), version).await {
                    Ok(found) => Ok(AttemptOutcome::Taken(found)),
                    Err(LogError::Storage { source, .. }) if source.is_not_found() => {
                        Ok(AttemptOutcome::Vacant)
                    }
                    Err(e) => Err(CommitError::Log { source: e }),
                }
            }
            Err(source) => Err(CommitError::Storage {
                table_path: self.table_path.clone(),
                source,
            }),
        }
    }

    fn roll_forward(
        &self,
        base: Option<&Snapshot>,
        version: Version,
        actions: Vec<Action>,
    ) -> Result<Snapshot, CommitError> {
        let now = crate::now_millis();
        let next = match base {
            Some(snapshot) => snapshot.advance(version, actions, now, &self.capabilities),
            None => {
                let mut state = ReplayState::new();
                state
                    .apply_commit(&self.table_path, version, actions, now)
                    .and_then(|()| {
                        Snapshot::from_replay(self.table_path.clone(), state, None, &self.capabilities)
                    })
            }
        };
        next.context(LogSnafu)
    }

    async fn post_commit(
        &self,
        base: Option<&Snapshot>,
        version: Version,
        committed: Vec<Action>,
    ) -> Result<Arc<Snapshot>, CommitError> {
        let snapshot = Arc::new(self.roll_forward(base, version, committed)?);
        if let Some(cache) = &self.cache {
            cache.publish(snapshot.clone());
        }

        if self.options.checkpoint_after_commit {
            if let Err(e) = self.checkpoint_if_due(&snapshot).await {
                warn!("{}: post-commit checkpoint of {version} failed: {e}", self.table_path);
            }
        }
        Ok(snapshot)
    }

    async fn checkpoint_if_due(&self, snapshot: &Snapshot) -> Result<(), LogError> {
        let config = snapshot.table_config();
        let interval = config.checkpoint_interval().context(crate::log::ConfigSnafu {
            table_path: self.table_path.clone(),
        })?;
        if !checkpoint::should_checkpoint(snapshot.version(), interval) {
            return Ok(());
        }
        checkpoint::write_checkpoint(self.store.as_ref(), snapshot).await?;
        let removed =
            retention::cleanup_expired_logs(self.store.as_ref(), snapshot, crate::now_millis()).await?;
        if removed > 0 {
            info!("{}: removed {removed} expired log file(s)", self.table_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::SetTransaction,
        predicate::CompareOp,
        schema::{DataType, PrimitiveType, StructField},
        storage::{InjectedFailure, MemoryLogStore},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn schema() -> StructType {
        StructType::new(vec![
            StructField::new("id", DataType::primitive(PrimitiveType::Long), true),
            StructField::new("part", DataType::primitive(PrimitiveType::String), true),
        ])
    }

    fn add(path: &str, part: &str) -> Action {
        let values = BTreeMap::from([("part".to_string(), Some(part.to_string()))]);
        Action::Add(AddFile::new(path, values, 10, 1, true).with_num_records(2))
    }

    async fn create(
        store: &Arc<MemoryLogStore>,
        configuration: BTreeMap<String, String>,
    ) -> Result<Arc<Snapshot>, Box<dyn std::error::Error>> {
        let dyn_store: Arc<dyn LogStore> = store.clone();
        let mut txn = OptimisticTransaction::for_new_table(
            dyn_store,
            CommitOptions::default(),
            ClientCapabilities::default(),
        );
        let metadata = Metadata::try_new(&schema(), vec!["part".to_string()], configuration)?;
        txn.update_metadata(metadata, MetadataUpdate::default())?;
        match txn
            .commit(
                vec![],
                Operation::CreateTable {
                    partition_by: vec!["part".to_string()],
                },
            )
            .await?
        {
            CommitOutcome::Committed {
                version,
                post_commit_snapshot,
                ..
            } => {
                assert_eq!(version, 0);
                Ok(post_commit_snapshot)
            }
            other => Err(format!("unexpected outcome {other:?}").into()),
        }
    }

    fn open(store: &Arc<MemoryLogStore>, snapshot: &Arc<Snapshot>) -> Result<OptimisticTransaction, CommitError> {
        OptimisticTransaction::new(
            store.clone(),
            snapshot.clone(),
            CommitOptions::default(),
            ClientCapabilities::default(),
        )
    }

    fn append() -> Operation {
        Operation::Write {
            mode: WriteMode::Append,
            predicate: None,
        }
    }

    #[tokio::test]
    async fn create_writes_commit_info_first() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("create"));
        let snapshot = create(&store, BTreeMap::new()).await?;
        assert_eq!(snapshot.partition_columns(), ["part".to_string()]);

        let actions = read_commit(store.as_ref(), 0).await?;
        let Some(Action::CommitInfo(info)) = actions.first() else {
            return Err("commitInfo must come first".into());
        };
        assert_eq!(info.operation.as_deref(), Some("CREATE TABLE"));
        assert!(info.txn_id.is_some());
        assert!(actions.iter().any(|a| matches!(a, Action::Protocol(_))));
        assert!(actions.iter().any(|a| matches!(a, Action::Metadata(_))));
        Ok(())
    }

    #[tokio::test]
    async fn new_table_needs_metadata() -> TestResult {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new("bare"));
        let mut txn = OptimisticTransaction::for_new_table(
            store,
            CommitOptions::default(),
            ClientCapabilities::default(),
        );
        let err = txn.commit(vec![], append()).await.expect_err("no metadata");
        assert!(matches!(err, CommitError::InvalidAction { .. }));
        assert_eq!(txn.state(), TransactionState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn blind_appends_rebase_past_each_other() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("appends"));
        let base = create(&store, BTreeMap::new()).await?;

        let mut first = open(&store, &base)?;
        let mut second = open(&store, &base)?;
        first.commit(vec![add("a.parquet", "1")], append()).await?;
        let outcome = second.commit(vec![add("b.parquet", "2")], append()).await?;

        let CommitOutcome::Committed {
            version,
            post_commit_snapshot,
            attempts,
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        assert_eq!(version, 2);
        assert_eq!(attempts, 2);
        assert_eq!(post_commit_snapshot.num_files(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_read_conflicts() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("overlap"));
        let base = create(&store, BTreeMap::new()).await?;

        let mut reader = open(&store, &base)?;
        let predicate = Predicate::eq("part", "1");
        assert!(reader.filter_files(Some(&predicate)).is_empty());

        let mut writer = open(&store, &base)?;
        writer.filter_files(Some(&predicate));
        writer.commit(vec![add("a.parquet", "1")], append()).await?;

        let err = reader
            .commit(vec![add("b.parquet", "1")], append())
            .await
            .expect_err("reader saw partition 1");
        assert!(err.is_conflict());
        let CommitError::Conflict {
            winning_version,
            kind,
            ..
        } = err
        else {
            return Err("expected a conflict".into());
        };
        assert_eq!(winning_version, 1);
        assert!(matches!(kind, ConflictKind::ConcurrentAppend { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn disjoint_partition_reads_do_not_conflict() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("disjoint"));
        let base = create(&store, BTreeMap::new()).await?;

        let mut reader = open(&store, &base)?;
        reader.filter_files(Some(&Predicate::eq("part", "2")));
        let mut writer = open(&store, &base)?;
        writer.commit(vec![add("a.parquet", "1")], append()).await?;

        let outcome = reader.commit(vec![add("b.parquet", "2")], append()).await?;
        assert_eq!(outcome.version(), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_app_version_is_skipped() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("idempotent"));
        let base = create(&store, BTreeMap::new()).await?;

        let mut txn = open(&store, &base)?;
        let batch = vec![
            add("a.parquet", "1"),
            Action::Txn(SetTransaction::new("stream", 7)),
        ];
        let outcome = txn.commit(batch.clone(), append()).await?;
        let CommitOutcome::Committed {
            post_commit_snapshot,
            ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        assert_eq!(post_commit_snapshot.app_transaction_version("stream"), Some(7));

        let mut again = open(&store, &post_commit_snapshot)?;
        let outcome = again.commit(batch, append()).await?;
        assert!(matches!(
            outcome,
            CommitOutcome::AlreadyCommitted { version: 7, .. }
        ));
        assert_eq!(outcome.version(), None);
        Ok(())
    }

    #[tokio::test]
    async fn ambiguous_write_that_landed_is_recognized() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("ambiguous"));
        let base = create(&store, BTreeMap::new()).await?;
        store.inject_failure(log_path::commit_path(1), InjectedFailure::AmbiguousApplied);

        let mut txn = open(&store, &base)?;
        let outcome = txn.commit(vec![add("a.parquet", "1")], append()).await?;
        let CommitOutcome::Committed {
            version, attempts, ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        assert_eq!((version, attempts), (1, 1));
        assert!(store.head(&log_path::commit_path(2)).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn ambiguous_write_that_was_lost_is_retried() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("lost"));
        let base = create(&store, BTreeMap::new()).await?;
        store.inject_failure(log_path::commit_path(1), InjectedFailure::AmbiguousLost);

        let mut txn = open(&store, &base)?;
        let outcome = txn.commit(vec![add("a.parquet", "1")], append()).await?;
        let CommitOutcome::Committed {
            version, attempts, ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        assert_eq!((version, attempts), (1, 2));
        Ok(())
    }

    #[tokio::test]
    async fn staged_metadata_cannot_be_passed_as_actions() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("actions"));
        let base = create(&store, BTreeMap::new()).await?;
        let mut txn = open(&store, &base)?;
        let err = txn
            .commit(vec![Action::Metadata(base.metadata().clone())], append())
            .await
            .expect_err("metadata in actions");
        assert!(matches!(err, CommitError::InvalidAction { .. }));

        let err = txn.commit(vec![], append()).await.expect_err("reused");
        assert!(matches!(
            err,
            CommitError::InvalidState {
                state: TransactionState::Failed,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn append_only_tables_reject_data_removal() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("append-only"));
        let config = BTreeMap::from([(keys::APPEND_ONLY.to_string(), "true".to_string())]);
        let base = create(&store, config).await?;
        let mut txn = open(&store, &base)?;
        txn.commit(vec![add("a.parquet", "1")], append()).await?;

        let current = Snapshot::try_new(store.as_ref(), None, &ClientCapabilities::default()).await?;
        let file = current.file("a.parquet").ok_or("file missing")?.clone();
        let mut txn = open(&store, &Arc::new(current))?;
        let err = txn
            .commit(
                vec![Action::Remove(file.remove())],
                Operation::Delete { predicate: None },
            )
            .await
            .expect_err("append-only");
        assert!(matches!(err, CommitError::AppendOnlyViolation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn enabling_row_tracking_upgrades_protocol_and_assigns_ids() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("rows"));
        let config = BTreeMap::from([(keys::ENABLE_ROW_TRACKING.to_string(), "true".to_string())]);
        let base = create(&store, config).await?;
        assert!(base.protocol().is_feature_supported(&ROW_TRACKING));

        let mut txn = open(&store, &base)?;
        let outcome = txn
            .commit(vec![add("a.parquet", "1"), add("b.parquet", "1")], append())
            .await?;
        let CommitOutcome::Committed {
            post_commit_snapshot,
            ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        let a = post_commit_snapshot.file("a.parquet").ok_or("a")?;
        let b = post_commit_snapshot.file("b.parquet").ok_or("b")?;
        assert_eq!((a.base_row_id, b.base_row_id), (Some(0), Some(2)));
        assert_eq!(a.default_row_commit_version, Some(1));
        assert_eq!(
            row_tracking::high_water_mark(Some(post_commit_snapshot.as_ref()))?,
            3
        );
        Ok(())
    }

    #[tokio::test]
    async fn in_commit_timestamps_increase() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("ict"));
        let config = BTreeMap::from([(
            keys::ENABLE_IN_COMMIT_TIMESTAMPS.to_string(),
            "true".to_string(),
        )]);
        let base = create(&store, config).await?;
        let mut txn = open(&store, &base)?;
        let outcome = txn.commit(vec![add("a.parquet", "1")], append()).await?;
        let CommitOutcome::Committed {
            post_commit_snapshot,
            ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };
        assert!(post_commit_snapshot.timestamp() > base.timestamp());

        let actions = read_commit(store.as_ref(), 1).await?;
        let Some(Action::CommitInfo(info)) = actions.first() else {
            return Err("commitInfo must come first".into());
        };
        assert_eq!(info.in_commit_timestamp, Some(post_commit_snapshot.timestamp()));
        Ok(())
    }

    #[tokio::test]
    async fn incompatible_schema_change_is_rejected() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("schema"));
        let base = create(&store, BTreeMap::new()).await?;
        let mut txn = open(&store, &base)?;

        let narrowed = StructType::new(vec![StructField::new(
            "part",
            DataType::primitive(PrimitiveType::String),
            true,
        )]);
        let metadata = base.metadata().with_schema(&narrowed)?;
        let err = txn
            .update_metadata(metadata.clone(), MetadataUpdate::default())
            .expect_err("column dropped");
        assert!(matches!(err, CommitError::SchemaMismatch { .. }));

        txn.update_metadata(
            metadata,
            MetadataUpdate {
                overwrite_schema: true,
                ..Default::default()
            },
        )?;
        let outcome = txn.commit(vec![], Operation::ChangeSchema).await?;
        assert_eq!(outcome.version(), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn string_partitions_match_exact_values() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("strings"));
        let base = create(&store, BTreeMap::new()).await?;
        let mut seed = open(&store, &base)?;
        let outcome = seed
            .commit(vec![add("x.parquet", "01"), add("y.parquet", "10")], append())
            .await?;
        let CommitOutcome::Committed {
            post_commit_snapshot: seeded,
            ..
        } = outcome
        else {
            return Err("expected a commit".into());
        };

        let paths = |p: &Predicate| -> Vec<String> {
            seeded.files_matching(p).map(|f| f.path.clone()).collect()
        };
        let not_one = Predicate::eq("part", "1").not();
        assert_eq!(paths(&not_one), ["x.parquet", "y.parquet"]);
        let below_nine = Predicate::compare("part", CompareOp::Lt, "9");
        assert_eq!(paths(&below_nine), ["x.parquet", "y.parquet"]);
        assert!(paths(&Predicate::eq("part", "1")).is_empty());

        let mut reader = open(&store, &seeded)?;
        reader.filter_files(Some(&not_one));
        let mut writer = open(&store, &seeded)?;
        writer.filter_files(Some(&Predicate::eq("part", "01")));
        writer.commit(vec![add("z.parquet", "01")], append()).await?;

        let err = reader
            .commit(vec![add("w.parquet", "2")], append())
            .await
            .expect_err("reader saw partition 01");
        assert!(matches!(
            err,
            CommitError::Conflict {
                kind: ConflictKind::ConcurrentAppend { .. },
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn schema_overwrite_conflicts_with_blind_append() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("overwrite"));
        let base = create(&store, BTreeMap::new()).await?;

        let mut rewrite = open(&store, &base)?;
        rewrite.filter_files(None);
        let narrowed = StructType::new(vec![StructField::new(
            "part",
            DataType::primitive(PrimitiveType::String),
            true,
        )]);
        rewrite.update_metadata(
            base.metadata().with_schema(&narrowed)?,
            MetadataUpdate {
                overwrite_schema: true,
                ..Default::default()
            },
        )?;

        let mut appender = open(&store, &base)?;
        appender
            .commit(vec![add("old-schema.parquet", "1")], append())
            .await?;

        let err = rewrite
            .commit(vec![], Operation::ChangeSchema)
            .await
            .expect_err("blind append was written against the old schema");
        match err {
            CommitError::Conflict { kind, .. } => assert_eq!(
                kind,
                ConflictKind::ConcurrentAppend {
                    path: "old-schema.parquet".to_string()
                }
            ),
            other => return Err(format!("expected a conflict, got {other}").into()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn negative_record_counts_fail_the_commit() -> TestResult {
        let store = Arc::new(MemoryLogStore::new("negative"));
        let config = BTreeMap::from([(keys::ENABLE_ROW_TRACKING.to_string(), "true".to_string())]);
        let base = create(&store, config).await?;

        let values = BTreeMap::from([("part".to_string(), Some("1".to_string()))]);
        let bogus = AddFile::new("a.parquet", values, 10, 1, true).with_num_records(-5);
        let mut txn = open(&store, &base)?;
        let err = txn
            .commit(vec![Action::Add(bogus)], append())
            .await
            .expect_err("negative numRecords");
        assert!(matches!(
            err,
            CommitError::RowTracking {
                source: RowTrackingError::NegativeNumRecords { records: -5, .. },
                ..
            }
        ));
        assert!(store.head(&log_path::commit_path(1)).await.is_err());
        Ok(())
    }
}
