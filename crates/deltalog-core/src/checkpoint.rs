//! Checkpoints: periodic materializations of folded table state.
//!
//! A checkpoint at version `v` holds, as Parquet rows, exactly the actions
//! needed to rebuild the snapshot at `v` without replaying commits `0..=v`:
//! the protocol, the metadata, the latest `txn` per application, live domains,
//! one `add` per live file and the tombstones still inside the deleted-file
//! retention window.
//!
//! Large checkpoints are split into `parts` files of at most
//! `delta.checkpoint.partSize` actions. After the parts are written the
//! `_last_checkpoint` pointer is advanced. The pointer is only a hint: readers
//! fall back to listing when it is missing, stale or unreadable.
//!
//! Writing a checkpoint is idempotent. Two writers racing on the same version
//! produce equivalent files and either may win.

mod codec;

use bytes::Bytes;
use chrono::TimeDelta;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    Version,
    actions::Action,
    config::ConfigError,
    log::{CheckpointFiles, ConfigSnafu, CorruptCheckpointSnafu, LogError, StorageSnafu},
    log_path,
    snapshot::Snapshot,
    storage::LogStore,
};

pub use codec::{CheckpointCodecError, checkpoint_schema, decode_actions, encode_actions};

/// Contents of the `_last_checkpoint` pointer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    /// Checkpoint version.
    pub version: Version,
    /// Number of actions stored across all parts.
    pub size: u64,
    /// Number of part files; absent for single-file checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
    /// Total bytes across all parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<u64>,
    /// Number of `add` actions stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_of_add_files: Option<u64>,
    /// Optional checksum of this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl CheckpointMetadata {
    /// Number of part files, counting a single-file checkpoint as one part.
    pub fn part_count(&self) -> u32 {
        self.parts.unwrap_or(1)
    }
}

/// Whether a commit at `version` should be followed by a checkpoint.
pub fn should_checkpoint(version: Version, interval: u64) -> bool {
    interval > 0 && version > 0 && version % interval == 0
}

/// Read the `_last_checkpoint` hint.
///
/// A missing, unreadable or malformed pointer yields `None`; callers then
/// discover checkpoints by listing.
pub async fn read_last_checkpoint(store: &dyn LogStore) -> Option<CheckpointMetadata> {
    let path = log_path::last_checkpoint_path();
    let bytes = match store.read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return None,
        Err(e) => {
            warn!("ignoring unreadable checkpoint pointer of {}: {e}", store.location());
            return None;
        }
    };
    match serde_json::from_slice::<CheckpointMetadata>(&bytes) {
        Ok(hint) => Some(hint),
        Err(e) => {
            warn!("ignoring malformed checkpoint pointer of {}: {e}", store.location());
            None
        }
    }
}

/// Actions a checkpoint of `snapshot` stores.
///
/// Tombstones deleted at or before `now - deleted_file_retention` are dropped.
pub fn checkpoint_actions(snapshot: &Snapshot, now: i64) -> Result<Vec<Action>, ConfigError> {
    let retention = snapshot.table_config().deleted_file_retention()?;
    let cutoff = retention_cutoff(now, retention);

    let mut actions = Vec::with_capacity(snapshot.num_files() + snapshot.tombstones().count() + 2);
    actions.push(Action::Protocol(snapshot.protocol().clone()));
    actions.push(Action::Metadata(snapshot.metadata().clone()));
    actions.extend(snapshot.set_transactions().cloned().map(Action::Txn));
    actions.extend(snapshot.domain_metadata_entries().cloned().map(Action::DomainMetadata));
    actions.extend(snapshot.all_files().cloned().map(Action::Add));
    actions.extend(
        snapshot
            .tombstones()
            .filter(|t| t.deletion_timestamp_or_epoch() > cutoff)
            .cloned()
            .map(Action::Remove),
    );
    Ok(actions)
}

/// Write a checkpoint of `snapshot` and advance the pointer.
pub async fn write_checkpoint(
    store: &dyn LogStore,
    snapshot: &Snapshot,
) -> Result<CheckpointMetadata, LogError> {
    let table_path = snapshot.table_path().to_string();
    let version = snapshot.version();
    let config = snapshot.table_config();
    let part_size = config.checkpoint_part_size().context(ConfigSnafu {
        table_path: table_path.clone(),
    })?;
    let actions = checkpoint_actions(snapshot, crate::now_millis()).context(ConfigSnafu {
        table_path: table_path.clone(),
    })?;

    let part_size = usize::try_from(part_size).unwrap_or(usize::MAX).max(1);
    let chunks: Vec<&[Action]> = actions.chunks(part_size).collect();
    let parts = u32::try_from(chunks.len()).unwrap_or(u32::MAX).max(1);
    let paths = log_path::checkpoint_paths(version, parts);

    let mut size_in_bytes = 0u64;
    for (chunk, path) in chunks.iter().zip(&paths) {
        let encoded = encode_actions(chunk).map_err(|e| LogError::Encode {
            table_path: table_path.clone(),
            msg: format!("checkpoint {version}: {e}"),
        })?;
        size_in_bytes += encoded.len() as u64;
        store
            .write(path, Bytes::from(encoded), true)
            .await
            .context(StorageSnafu {
                table_path: table_path.clone(),
            })?;
    }

    let hint = CheckpointMetadata {
        version,
        size: actions.len() as u64,
        parts: (parts > 1).then_some(parts),
        size_in_bytes: Some(size_in_bytes),
        num_of_add_files: Some(snapshot.num_files() as u64),
        checksum: None,
    };

    let newer = read_last_checkpoint(store)
        .await
        .is_none_or(|existing| existing.version <= version);
    if newer {
        let body = serde_json::to_vec(&hint).map_err(|e| LogError::Encode {
            table_path: table_path.clone(),
            msg: format!("checkpoint pointer: {e}"),
        })?;
        store
            .write(&log_path::last_checkpoint_path(), Bytes::from(body), true)
            .await
            .context(StorageSnafu {
                table_path: table_path.clone(),
            })?;
    } else {
        debug!("checkpoint pointer of {table_path} already past {version}; leaving it");
    }

    info!(
        "wrote checkpoint {version} of {table_path}: {} actions in {parts} part(s)",
        hint.size
    );
    Ok(hint)
}

/// Read and decode every part of a checkpoint, in part order.
///
/// When the pointer describes the same version its action count is checked
/// against what was read.
pub async fn read_checkpoint(
    store: &dyn LogStore,
    files: &CheckpointFiles,
) -> Result<Vec<Action>, LogError> {
    let table_path = store.location().to_string();
    let version = files.version;
    let mut actions = Vec::new();
    for part in &files.parts {
        let bytes = store.read(&part.path).await.context(StorageSnafu {
            table_path: table_path.clone(),
        })?;
        let decoded = decode_actions(bytes).map_err(|e| LogError::CorruptCheckpoint {
            table_path: table_path.clone(),
            version,
            msg: format!("{}: {e}", part.path),
        })?;
        actions.extend(decoded);
    }

    if let Some(hint) = read_last_checkpoint(store).await {
        let same_layout = hint.version == version && hint.part_count() as usize == files.parts.len();
        ensure!(
            !same_layout || hint.size == actions.len() as u64,
            CorruptCheckpointSnafu {
                table_path,
                version,
                msg: format!(
                    "pointer records {} actions but parts hold {}",
                    hint.size,
                    actions.len()
                ),
            }
        );
    }
    Ok(actions)
}

/// Tombstones deleted at or before the returned time are past `retention`.
pub(crate) fn retention_cutoff(now: i64, retention: TimeDelta) -> i64 {
    now.saturating_sub(retention.num_milliseconds())
}
