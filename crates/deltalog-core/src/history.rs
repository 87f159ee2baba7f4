//! Commit provenance and timestamp-based version lookup.
//!
//! The timestamp of a commit is its in-commit timestamp when present, else the
//! `commitInfo.timestamp`, else the commit file's modification time. File
//! times are not guaranteed to increase with versions, so lookups adjust each
//! timestamp to at least one millisecond after its predecessor.

use snafu::prelude::*;

use crate::{
    Version,
    actions::{Action, CommitInfo},
    log::{
        LogError, TableNotFoundSnafu, TimestampAfterLatestCommitSnafu,
        TimestampBeforeFirstCommitSnafu, read_commit, segment,
    },
    log_path::ParsedLogPath,
    storage::LogStore,
};

/// One commit as reported by [`history`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    /// Commit version.
    pub version: Version,
    /// Commit timestamp in milliseconds.
    pub timestamp: i64,
    /// The commit's `commitInfo`, if it wrote one.
    pub commit_info: Option<CommitInfo>,
}

impl CommitEntry {
    /// Operation recorded by the writer.
    pub fn operation(&self) -> Option<&str> {
        self.commit_info.as_ref()?.operation.as_deref()
    }
}

async fn read_entry(store: &dyn LogStore, commit: &ParsedLogPath) -> Result<CommitEntry, LogError> {
    let commit_info = read_commit(store, commit.version)
        .await?
        .into_iter()
        .find_map(|a| match a {
            Action::CommitInfo(ci) => Some(ci),
            _ => None,
        });
    let timestamp = commit_info
        .as_ref()
        .and_then(CommitInfo::commit_timestamp)
        .unwrap_or_else(|| commit.file.last_modified.timestamp_millis());
    Ok(CommitEntry {
        version: commit.version,
        timestamp,
        commit_info,
    })
}

/// Commits still present in the log, newest first, at most `limit` of them.
pub async fn history(store: &dyn LogStore, limit: Option<usize>) -> Result<Vec<CommitEntry>, LogError> {
    let commits = segment::list_commits(store).await?;
    let take = limit.unwrap_or(commits.len());
    let mut out = Vec::with_capacity(take.min(commits.len()));
    for commit in commits.iter().rev().take(take) {
        out.push(read_entry(store, commit).await?);
    }
    Ok(out)
}

/// Latest version committed at or before `timestamp` (milliseconds).
///
/// Fails when `timestamp` precedes the earliest available commit or follows
/// the latest one.
pub async fn version_at_timestamp(store: &dyn LogStore, timestamp: i64) -> Result<Version, LogError> {
    let table_path = store.location().to_string();
    let commits = segment::list_commits(store).await?;

    let mut entries: Vec<(Version, i64)> = Vec::with_capacity(commits.len());
    for commit in &commits {
        let entry = read_entry(store, commit).await?;
        let adjusted = match entries.last() {
            Some(&(_, previous)) => entry.timestamp.max(previous + 1),
            None => entry.timestamp,
        };
        entries.push((entry.version, adjusted));
    }
    resolve(&table_path, &entries, timestamp)
}

fn resolve(table_path: &str, entries: &[(Version, i64)], timestamp: i64) -> Result<Version, LogError> {
    let (Some(&(_, earliest)), Some(&(latest_version, latest))) = (entries.first(), entries.last())
    else {
        return TableNotFoundSnafu { table_path }.fail();
    };
    ensure!(
        timestamp >= earliest,
        TimestampBeforeFirstCommitSnafu {
            table_path,
            timestamp,
            earliest,
        }
    );
    ensure!(
        timestamp <= latest,
        TimestampAfterLatestCommitSnafu {
            table_path,
            timestamp,
            latest,
        }
    );
    let after = entries.partition_point(|&(_, ts)| ts <= timestamp);
    Ok(entries
        .get(after.saturating_sub(1))
        .map_or(latest_version, |&(v, _)| v))
}
