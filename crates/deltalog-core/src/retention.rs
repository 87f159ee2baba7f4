//! Expired log cleanup.
//!
//! Commit and checkpoint files older than `delta.logRetentionDuration` are
//! deleted, but only below the newest complete checkpoint that is itself past
//! the cutoff. Everything from that checkpoint on stays, so the latest state
//! and every version after the checkpoint remain reconstructable.
//!
//! Files are deleted oldest first: an interrupted cleanup leaves a contiguous
//! log suffix behind.

use std::collections::BTreeSet;

use log::{debug, info};
use snafu::prelude::*;

use crate::{
    Version,
    checkpoint::retention_cutoff,
    log::{ConfigSnafu, LogError, StorageSnafu, segment},
    log_path::ParsedLogPath,
    snapshot::Snapshot,
    storage::LogStore,
};

fn expired(file: &ParsedLogPath, cutoff: i64) -> bool {
    file.file.last_modified.timestamp_millis() <= cutoff
}

/// Newest complete checkpoint at or below `max_version` whose files are all
/// past `cutoff`.
fn cleanup_boundary(listed: &[ParsedLogPath], max_version: Version, cutoff: i64) -> Option<Version> {
    let mut excluded = BTreeSet::new();
    loop {
        let candidate = segment::select_checkpoint(listed, Some(max_version), &excluded)?;
        if candidate
            .parts
            .iter()
            .all(|part| part.last_modified.timestamp_millis() <= cutoff)
        {
            return Some(candidate.version);
        }
        excluded.insert(candidate.version);
    }
}

/// Delete log files that expired before `now` (milliseconds).
///
/// Returns the number of files removed. A no-op when
/// `delta.enableExpiredLogCleanup` is false.
pub async fn cleanup_expired_logs(
    store: &dyn LogStore,
    snapshot: &Snapshot,
    now: i64,
) -> Result<usize, LogError> {
    let table_path = snapshot.table_path();
    let config = snapshot.table_config();
    if !config
        .expired_log_cleanup_enabled()
        .context(ConfigSnafu { table_path })?
    {
        debug!("expired log cleanup disabled for {table_path}");
        return Ok(0);
    }
    let retention = config.log_retention().context(ConfigSnafu { table_path })?;
    let cutoff = retention_cutoff(now, retention);

    let listed = segment::list_log_files(store, 0, table_path).await?;
    let Some(boundary) = cleanup_boundary(&listed, snapshot.version(), cutoff) else {
        debug!("no checkpoint of {table_path} is old enough to clean up behind");
        return Ok(0);
    };

    let mut doomed: Vec<&ParsedLogPath> = listed
        .iter()
        .filter(|p| p.version < boundary && expired(p, cutoff))
        .collect();
    doomed.sort_by_key(|p| (p.version, p.is_checkpoint()));

    let mut removed = 0;
    for file in doomed {
        match store.delete(&file.file.path).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(StorageSnafu { table_path }),
        }
    }
    if removed > 0 {
        info!("deleted {removed} expired log file(s) of {table_path} below checkpoint {boundary}");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{self, Action, Metadata, Protocol},
        checkpoint,
        config::keys,
        log_path,
        protocol::ClientCapabilities,
        schema::{DataType, PrimitiveType, StructField, StructType},
        storage::MemoryLogStore,
    };
    use bytes::Bytes;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::collections::BTreeMap;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    async fn seed(store: &MemoryLogStore, configuration: BTreeMap<String, String>) -> TestResult {
        let schema = StructType::new(vec![StructField::new(
            "id",
            DataType::primitive(PrimitiveType::Long),
            true,
        )]);
        let first = [
            Action::Protocol(Protocol::legacy(1, 2)),
            Action::Metadata(Metadata::try_new(&schema, vec![], configuration)?),
        ];
        for version in 0..5u64 {
            let batch: &[Action] = if version == 0 { &first } else { &[] };
            store
                .write(
                    &log_path::commit_path(version),
                    Bytes::from(actions::serialize_actions(batch)?),
                    false,
                )
                .await?;
        }
        Ok(())
    }

    fn age_all(store: &MemoryLogStore, at: DateTime<Utc>) {
        for path in store.paths() {
            store.set_last_modified(&path, at);
        }
    }

    #[tokio::test]
    async fn deletes_only_below_an_expired_checkpoint() -> TestResult {
        let store = MemoryLogStore::new("retention");
        seed(&store, BTreeMap::new()).await?;
        let caps = ClientCapabilities::default();
        let at_three = Snapshot::try_new(&store, Some(3), &caps).await?;
        checkpoint::write_checkpoint(&store, &at_three).await?;

        let long_ago = Utc::now() - TimeDelta::days(60);
        age_all(&store, long_ago);
        let latest = Snapshot::try_new(&store, None, &caps).await?;
        let removed = cleanup_expired_logs(&store, &latest, crate::now_millis()).await?;
        assert_eq!(removed, 3);

        let remaining: Vec<String> = store.paths();
        assert!(!remaining.contains(&log_path::commit_path(2)));
        assert!(remaining.contains(&log_path::commit_path(3)));
        assert!(remaining.contains(&log_path::checkpoint_path(3)));

        let reloaded = Snapshot::try_new(&store, None, &caps).await?;
        assert_eq!(reloaded.version(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn recent_checkpoints_protect_history() -> TestResult {
        let store = MemoryLogStore::new("recent");
        seed(&store, BTreeMap::new()).await?;
        let caps = ClientCapabilities::default();
        age_all(&store, Utc::now() - TimeDelta::days(60));
        let at_three = Snapshot::try_new(&store, Some(3), &caps).await?;
        checkpoint::write_checkpoint(&store, &at_three).await?;

        let latest = Snapshot::try_new(&store, None, &caps).await?;
        assert_eq!(cleanup_expired_logs(&store, &latest, crate::now_millis()).await?, 0);
        assert_eq!(
            cleanup_expired_logs(&store, &latest, crate::now_millis() + 31 * DAY).await?,
            3
        );
        Ok(())
    }

    #[tokio::test]
    async fn disabled_cleanup_keeps_everything() -> TestResult {
        let store = MemoryLogStore::new("disabled");
        let config = BTreeMap::from([(
            keys::ENABLE_EXPIRED_LOG_CLEANUP.to_string(),
            "false".to_string(),
        )]);
        seed(&store, config).await?;
        let caps = ClientCapabilities::default();
        let at_three = Snapshot::try_new(&store, Some(3), &caps).await?;
        checkpoint::write_checkpoint(&store, &at_three).await?;
        age_all(&store, Utc::now() - TimeDelta::days(60));

        let latest = Snapshot::try_new(&store, None, &caps).await?;
        assert_eq!(cleanup_expired_logs(&store, &latest, crate::now_millis()).await?, 0);
        Ok(())
    }
}
