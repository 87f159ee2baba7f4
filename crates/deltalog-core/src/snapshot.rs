//! Immutable, versioned views of table state.
//!
//! A [`Snapshot`] is produced by replaying a [`LogSegment`] and never changes
//! afterwards. Rolling forward ([`Snapshot::update`], [`Snapshot::advance`])
//! yields a new snapshot; existing references keep seeing their version.
//!
//! Large collections are held behind `Arc` so cloning a snapshot is cheap.

pub mod cache;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use snafu::prelude::*;

use crate::{
    Version,
    actions::{Action, AddFile, DomainMetadata, Metadata, Protocol, RemoveFile, SetTransaction},
    checkpoint::{self, retention_cutoff},
    config::{ConfigError, TableConfig},
    log::{
        CheckpointFiles, InvalidSchemaSnafu, LogError, LogSegment, MissingMetadataSnafu,
        MissingProtocolSnafu, ProtocolSnafu, ReplayState, read_commit, segment,
    },
    log_path::{self, ParsedLogPath},
    predicate::{PartitionColumns, Predicate},
    protocol::ClientCapabilities,
    schema::StructType,
    storage::LogStore,
};

pub use cache::SnapshotCache;

/// Table state at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    table_path: String,
    version: Version,
    protocol: Protocol,
    metadata: Metadata,
    schema: Arc<StructType>,
    partition_schema: Arc<PartitionColumns>,
    files: Arc<BTreeMap<String, AddFile>>,
    tombstones: Arc<BTreeMap<String, RemoveFile>>,
    set_transactions: Arc<BTreeMap<String, SetTransaction>>,
    domain_metadata: Arc<BTreeMap<String, DomainMetadata>>,
    timestamp: i64,
    checkpoint_version: Option<Version>,
}

impl Snapshot {
    /// Load the snapshot at `version`, or the latest when `None`.
    ///
    /// A checkpoint that cannot be read is skipped in favour of an older one
    /// (or full replay); a corrupt commit is fatal.
    pub async fn try_new(
        store: &dyn LogStore,
        version: Option<Version>,
        capabilities: &ClientCapabilities,
    ) -> Result<Self, LogError> {
        let table_path = store.location().to_string();
        let mut excluded = BTreeSet::new();
        loop {
            let segment = LogSegment::build(store, version, &excluded).await?;
            let mut state = ReplayState::new();

            if let Some(files) = &segment.checkpoint {
                match checkpoint::read_checkpoint(store, files).await {
                    Ok(actions) => {
                        let timestamp = if segment.commits.is_empty() {
                            checkpoint_timestamp(store, files).await
                        } else {
                            0
                        };
                        state.apply_checkpoint(files.version, actions, timestamp);
                    }
                    Err(e) if checkpoint_unusable(&e) => {
                        warn!(
                            "checkpoint {} of {table_path} unusable, falling back: {e}",
                            files.version
                        );
                        excluded.insert(files.version);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            debug!(
                "loading {table_path} at {}: checkpoint {:?}, {} commit(s)",
                segment.end_version,
                segment.checkpoint_version(),
                segment.commits.len()
            );
            replay_commits(store, &table_path, &mut state, &segment.commits).await?;
            return Self::from_replay(table_path, state, segment.checkpoint_version(), capabilities);
        }
    }

    /// Build a snapshot from a finished replay.
    pub fn from_replay(
        table_path: String,
        state: ReplayState,
        checkpoint_version: Option<Version>,
        capabilities: &ClientCapabilities,
    ) -> Result<Self, LogError> {
        let version = state.next_version().saturating_sub(1);
        let Some(protocol) = state.protocol else {
            return MissingProtocolSnafu { table_path, version }.fail();
        };
        let Some(metadata) = state.metadata else {
            return MissingMetadataSnafu { table_path, version }.fail();
        };
        protocol.validate().context(ProtocolSnafu {
            table_path: table_path.clone(),
        })?;
        capabilities.ensure_can_read(&protocol).context(ProtocolSnafu {
            table_path: table_path.clone(),
        })?;
        let schema = metadata.schema().context(InvalidSchemaSnafu {
            table_path: table_path.clone(),
        })?;
        let partition_schema = Arc::new(PartitionColumns::new(&schema, &metadata.partition_columns));

        Ok(Snapshot {
            table_path,
            version,
            protocol,
            metadata,
            schema,
            partition_schema,
            files: Arc::new(state.files),
            tombstones: Arc::new(state.tombstones),
            set_transactions: Arc::new(state.set_transactions),
            domain_metadata: Arc::new(state.domain_metadata),
            timestamp: state.last_timestamp.unwrap_or_default(),
            checkpoint_version,
        })
    }

    /// Replay state equivalent to this snapshot, for rolling forward.
    pub fn to_replay_state(&self) -> ReplayState {
        ReplayState {
            version: Some(self.version),
            protocol: Some(self.protocol.clone()),
            metadata: Some(self.metadata.clone()),
            files: (*self.files).clone(),
            tombstones: (*self.tombstones).clone(),
            set_transactions: (*self.set_transactions).clone(),
            domain_metadata: (*self.domain_metadata).clone(),
            last_commit_info: None,
            last_timestamp: Some(self.timestamp),
        }
    }

    /// Roll forward to the latest version (or `target`) by replaying only the
    /// commits newer than this snapshot.
    ///
    /// Returns `None` when nothing newer exists. Falls back to a full load when
    /// the commits following this snapshot are no longer available.
    pub async fn update(
        &self,
        store: &dyn LogStore,
        target: Option<Version>,
        capabilities: &ClientCapabilities,
    ) -> Result<Option<Self>, LogError> {
        let commits = match segment::commits_after(store, self.version, target).await {
            Ok(commits) => commits,
            Err(LogError::VersionGap { .. }) => {
                debug!("history after {} of {} is gone; reloading", self.version, self.table_path);
                return Self::try_new(store, target, capabilities).await.map(Some);
            }
            Err(e) => return Err(e),
        };
        if commits.is_empty() {
            return Ok(None);
        }

        let mut state = self.to_replay_state();
        replay_commits(store, &self.table_path, &mut state, &commits).await?;
        Self::from_replay(
            self.table_path.clone(),
            state,
            self.checkpoint_version,
            capabilities,
        )
        .map(Some)
    }

    /// Apply one already-read commit on top of this snapshot.
    pub fn advance(
        &self,
        version: Version,
        actions: Vec<Action>,
        file_timestamp: i64,
        capabilities: &ClientCapabilities,
    ) -> Result<Self, LogError> {
        let mut state = self.to_replay_state();
        state.apply_commit(&self.table_path, version, actions, file_timestamp)?;
        Self::from_replay(
            self.table_path.clone(),
            state,
            self.checkpoint_version,
            capabilities,
        )
    }

    /// Table root this snapshot was loaded from.
    pub fn table_path(&self) -> &str {
        &self.table_path
    }

    /// Snapshot version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Live protocol.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Live metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Parsed table schema.
    pub fn schema(&self) -> &Arc<StructType> {
        &self.schema
    }

    /// Partition column names, in declaration order.
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Partition columns with the ordering their values compare by.
    pub fn partition_schema(&self) -> &PartitionColumns {
        &self.partition_schema
    }

    /// Raw table properties.
    pub fn configuration(&self) -> &BTreeMap<String, String> {
        &self.metadata.configuration
    }

    /// Typed view over [`Snapshot::configuration`].
    pub fn table_config(&self) -> TableConfig<'_> {
        TableConfig::new(&self.metadata.configuration)
    }

    /// Commit timestamp of this version in milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// [`Snapshot::timestamp`] as a `DateTime`.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Version of the checkpoint this snapshot was built from, if any.
    pub fn checkpoint_version(&self) -> Option<Version> {
        self.checkpoint_version
    }

    /// Number of live files.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Live files ordered by path.
    pub fn all_files(&self) -> impl Iterator<Item = &AddFile> + '_ {
        self.files.values()
    }

    /// Live file at `path`.
    pub fn file(&self, path: &str) -> Option<&AddFile> {
        self.files.get(path)
    }

    /// Live files that may match `predicate` by partition values.
    ///
    /// Files are excluded only when the predicate is provably false for them.
    pub fn files_matching<'a>(
        &'a self,
        predicate: &'a Predicate,
    ) -> impl Iterator<Item = &'a AddFile> + 'a {
        let columns = self.partition_schema.as_ref();
        self.files
            .values()
            .filter(move |add| predicate.might_match_add(columns, add))
    }

    /// Tombstones still recorded in the state.
    pub fn tombstones(&self) -> impl Iterator<Item = &RemoveFile> + '_ {
        self.tombstones.values()
    }

    /// Tombstones past `delta.deletedFileRetentionDuration` at `now` (ms),
    /// whose files an external vacuum may delete.
    pub fn expired_tombstones(&self, now: i64) -> Result<Vec<&RemoveFile>, ConfigError> {
        let cutoff = retention_cutoff(now, self.table_config().deleted_file_retention()?);
        Ok(self
            .tombstones
            .values()
            .filter(|t| t.deletion_timestamp_or_epoch() <= cutoff)
            .collect())
    }

    /// Latest `txn` marker per application.
    pub fn set_transactions(&self) -> impl Iterator<Item = &SetTransaction> + '_ {
        self.set_transactions.values()
    }

    /// Last committed version recorded by `app_id`.
    pub fn app_transaction_version(&self, app_id: &str) -> Option<i64> {
        self.set_transactions.get(app_id).map(|t| t.version)
    }

    /// Live domain named `domain`.
    pub fn domain_metadata(&self, domain: &str) -> Option<&DomainMetadata> {
        self.domain_metadata.get(domain)
    }

    /// All live domains ordered by name.
    pub fn domain_metadata_entries(&self) -> impl Iterator<Item = &DomainMetadata> + '_ {
        self.domain_metadata.values()
    }
}

fn checkpoint_unusable(err: &LogError) -> bool {
    match err {
        LogError::CorruptCheckpoint { .. } => true,
        LogError::Storage { source, .. } => source.is_not_found(),
        _ => false,
    }
}

/// Timestamp of the commit a checkpoint was taken at. Falls back to the
/// checkpoint's modification time once that commit has been cleaned up.
async fn checkpoint_timestamp(store: &dyn LogStore, files: &CheckpointFiles) -> i64 {
    let written = files
        .parts
        .iter()
        .map(|p| p.last_modified.timestamp_millis())
        .max()
        .unwrap_or_default();
    let Ok(actions) = read_commit(store, files.version).await else {
        return written;
    };
    let recorded = actions.iter().find_map(|a| match a {
        Action::CommitInfo(ci) => ci.commit_timestamp(),
        _ => None,
    });
    match recorded {
        Some(ts) => ts,
        None => store
            .head(&log_path::commit_path(files.version))
            .await
            .map_or(written, |f| f.last_modified.timestamp_millis()),
    }
}

async fn replay_commits(
    store: &dyn LogStore,
    table_path: &str,
    state: &mut ReplayState,
    commits: &[ParsedLogPath],
) -> Result<(), LogError> {
    for commit in commits {
        let actions = read_commit(store, commit.version).await?;
        state.apply_commit(
            table_path,
            commit.version,
            actions,
            commit.file.last_modified.timestamp_millis(),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions,
        log_path,
        schema::{DataType, PrimitiveType, StructField},
        storage::MemoryLogStore,
    };
    use bytes::Bytes;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn metadata() -> Result<Metadata, Box<dyn std::error::Error>> {
        let schema = StructType::new(vec![
            StructField::new("id", DataType::primitive(PrimitiveType::Integer), true),
            StructField::new("p", DataType::primitive(PrimitiveType::String), true),
        ]);
        Ok(Metadata::try_new(&schema, vec!["p".to_string()], BTreeMap::new())?)
    }

    fn add(path: &str, p: &str) -> AddFile {
        let mut pv = BTreeMap::new();
        pv.insert("p".to_string(), Some(p.to_string()));
        AddFile::new(path, pv, 10, 1, true)
    }

    async fn commit(store: &MemoryLogStore, version: Version, batch: &[Action]) -> TestResult {
        let bytes = actions::serialize_actions(batch)?;
        store
            .write(&log_path::commit_path(version), Bytes::from(bytes), false)
            .await?;
        Ok(())
    }

    async fn seed(store: &MemoryLogStore) -> TestResult {
        commit(
            store,
            0,
            &[
                Action::Protocol(Protocol::legacy(1, 2)),
                Action::Metadata(metadata()?),
            ],
        )
        .await?;
        commit(store, 1, &[Action::Add(add("a", "1")), Action::Add(add("b", "2"))]).await?;
        commit(store, 2, &[Action::Remove(add("a", "1").remove_with(5, true))]).await?;
        Ok(())
    }

    #[tokio::test]
    async fn loads_latest_and_time_travels() -> TestResult {
        let store = MemoryLogStore::new("t");
        seed(&store).await?;
        let caps = ClientCapabilities::default();

        let latest = Snapshot::try_new(&store, None, &caps).await?;
        assert_eq!(latest.version(), 2);
        assert_eq!(latest.all_files().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(latest.tombstones().count(), 1);

        let v1 = Snapshot::try_new(&store, Some(1), &caps).await?;
        assert_eq!(v1.num_files(), 2);
        assert_eq!(v1.partition_columns(), ["p".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn files_matching_prunes_by_partition() -> TestResult {
        let store = MemoryLogStore::new("t");
        seed(&store).await?;
        let snap = Snapshot::try_new(&store, Some(1), &ClientCapabilities::default()).await?;
        let pred = Predicate::eq("p", "2");
        let hits: Vec<_> = snap.files_matching(&pred).map(|f| f.path.clone()).collect();
        assert_eq!(hits, vec!["b".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn update_replays_only_new_commits() -> TestResult {
        let store = MemoryLogStore::new("t");
        seed(&store).await?;
        let caps = ClientCapabilities::default();
        let snap = Snapshot::try_new(&store, None, &caps).await?;
        assert!(snap.update(&store, None, &caps).await?.is_none());

        commit(&store, 3, &[Action::Add(add("c", "3"))]).await?;
        let next = snap.update(&store, None, &caps).await?.ok_or("expected newer snapshot")?;
        assert_eq!(next.version(), 3);
        assert_eq!(next.num_files(), 2);
        assert_eq!(snap.num_files(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_protocol_is_reported() -> TestResult {
        let store = MemoryLogStore::new("t");
        commit(&store, 0, &[Action::Metadata(metadata()?)]).await?;
        let err = Snapshot::try_new(&store, None, &ClientCapabilities::default())
            .await
            .expect_err("no protocol");
        assert!(matches!(err, LogError::MissingProtocol { version: 0, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_checkpoint_falls_back_to_replay() -> TestResult {
        let store = MemoryLogStore::new("t");
        seed(&store).await?;
        store
            .write(&log_path::checkpoint_path(1), Bytes::from_static(b"garbage"), true)
            .await?;
        let snap = Snapshot::try_new(&store, None, &ClientCapabilities::default()).await?;
        assert_eq!(snap.version(), 2);
        assert_eq!(snap.checkpoint_version(), None);
        assert_eq!(snap.num_files(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn client_without_feature_cannot_read() -> TestResult {
        let store = MemoryLogStore::new("t");
        commit(
            &store,
            0,
            &[
                Action::Protocol(Protocol::legacy(2, 5)),
                Action::Metadata(metadata()?),
            ],
        )
        .await?;
        let caps = ClientCapabilities::default().without_feature("columnMapping");
        let err = Snapshot::try_new(&store, None, &caps)
            .await
            .expect_err("column mapping unsupported");
        assert!(err.to_string().contains("columnMapping"));
        Ok(())
    }

    #[tokio::test]
    async fn expired_tombstones_respect_retention() -> TestResult {
        let store = MemoryLogStore::new("t");
        seed(&store).await?;
        let snap = Snapshot::try_new(&store, None, &ClientCapabilities::default()).await?;
        assert!(snap.expired_tombstones(10)?.is_empty());
        let week_later = 5 + 7 * 24 * 3600 * 1000;
        assert_eq!(snap.expired_tombstones(week_later)?.len(), 1);
        Ok(())
    }
}
