//! Log segment discovery.
//!
//! A [`LogSegment`] is the minimal set of files needed to reconstruct the table
//! at a version: the newest complete checkpoint at or below it (if any) and
//! every commit after that checkpoint up to the version.
//!
//! Listing may lag behind writes on object stores, so after listing we probe
//! for the next commit by name until a probe misses, and probe any holes inside
//! the listed range before declaring a version gap.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use snafu::prelude::*;

use crate::{
    Version, checkpoint,
    log_path::{self, LogPathKind, ParsedLogPath},
    storage::{FileMeta, LogStore},
};

use super::{
    LogError, StorageSnafu, TableNotFoundSnafu, VersionAfterLatestSnafu, VersionGapSnafu,
    VersionNotAvailableSnafu,
};

/// The files of one complete checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    /// Checkpoint version.
    pub version: Version,
    /// Part files ordered by part number; a single entry for classic checkpoints.
    pub parts: Vec<FileMeta>,
}

/// Files needed to reconstruct the table at [`LogSegment::end_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    /// Version the segment reconstructs.
    pub end_version: Version,
    /// Starting checkpoint, if any.
    pub checkpoint: Option<CheckpointFiles>,
    /// Contiguous commits after the checkpoint, ascending.
    pub commits: Vec<ParsedLogPath>,
}

impl LogSegment {
    /// Discover the segment for `target` (or the latest version when `None`).
    ///
    /// Checkpoint versions in `excluded` are ignored; callers use this to fall
    /// back to an older checkpoint after a checkpoint fails to load.
    pub async fn build(
        store: &dyn LogStore,
        target: Option<Version>,
        excluded: &BTreeSet<Version>,
    ) -> Result<Self, LogError> {
        let table_path = store.location().to_string();

        let hinted = checkpoint::read_last_checkpoint(store)
            .await
            .map(|hint| hint.version)
            .filter(|v| target.is_none_or(|t| *v <= t) && !excluded.contains(v));
        let start = hinted.unwrap_or(0);

        let mut listed = list_log_files(store, start, &table_path).await?;
        let mut selected = select_checkpoint(&listed, target, excluded);
        if selected.is_none() && start > 0 {
            debug!("checkpoint hint {start} for {table_path} unusable; listing from 0");
            listed = list_log_files(store, 0, &table_path).await?;
            selected = select_checkpoint(&listed, target, excluded);
        }
        let checkpoint_version = selected.as_ref().map(|c| c.version);

        let mut commits: Vec<ParsedLogPath> = listed
            .iter()
            .filter(|p| p.is_commit())
            .filter(|p| checkpoint_version.is_none_or(|c| p.version > c))
            .filter(|p| target.is_none_or(|t| p.version <= t))
            .cloned()
            .collect();

        fill_listing_holes(store, &mut commits, &table_path).await?;
        probe_tail(store, &mut commits, checkpoint_version, target, &table_path).await?;

        let expected_first = checkpoint_version.map_or(0, |c| c + 1);
        let first_found = commits.first().map(|c| c.version);
        let history_missing = match first_found {
            Some(first) => first != expected_first,
            None => checkpoint_version.is_none(),
        };
        if history_missing {
            return Err(missing_history(table_path, &listed, target, expected_first, first_found));
        }

        let mut expected = expected_first;
        for commit in &commits {
            ensure!(
                commit.version == expected,
                VersionGapSnafu {
                    table_path: table_path.clone(),
                    expected,
                    found: commit.version,
                }
            );
            expected += 1;
        }

        let end_version = match commits.last().map(|c| c.version).or(checkpoint_version) {
            Some(v) => v,
            None => return TableNotFoundSnafu { table_path }.fail(),
        };
        if let Some(version) = target {
            ensure!(
                end_version >= version,
                VersionAfterLatestSnafu {
                    table_path,
                    version,
                    latest: end_version,
                }
            );
        }

        Ok(LogSegment {
            end_version,
            checkpoint: selected,
            commits,
        })
    }

    /// Version of the starting checkpoint, if any.
    pub fn checkpoint_version(&self) -> Option<Version> {
        self.checkpoint.as_ref().map(|c| c.version)
    }
}

/// Commits after `after` (up to `target`), contiguous from `after + 1`.
///
/// Used to roll an existing snapshot forward without rediscovering its base.
pub async fn commits_after(
    store: &dyn LogStore,
    after: Version,
    target: Option<Version>,
) -> Result<Vec<ParsedLogPath>, LogError> {
    let table_path = store.location().to_string();
    let mut commits: Vec<ParsedLogPath> = list_log_files(store, after + 1, &table_path)
        .await?
        .into_iter()
        .filter(|p| p.is_commit() && p.version > after)
        .filter(|p| target.is_none_or(|t| p.version <= t))
        .collect();
    fill_listing_holes(store, &mut commits, &table_path).await?;
    probe_tail(store, &mut commits, Some(after), target, &table_path).await?;

    let mut expected = after + 1;
    for commit in &commits {
        ensure!(
            commit.version == expected,
            VersionGapSnafu {
                table_path: table_path.clone(),
                expected,
                found: commit.version,
            }
        );
        expected += 1;
    }
    Ok(commits)
}

/// Every commit still present in the log, oldest first.
pub async fn list_commits(store: &dyn LogStore) -> Result<Vec<ParsedLogPath>, LogError> {
    let table_path = store.location().to_string();
    let mut commits: Vec<ParsedLogPath> = list_log_files(store, 0, &table_path)
        .await?
        .into_iter()
        .filter(ParsedLogPath::is_commit)
        .collect();
    fill_listing_holes(store, &mut commits, &table_path).await?;
    probe_tail(store, &mut commits, None, None, &table_path).await?;
    ensure!(!commits.is_empty(), TableNotFoundSnafu { table_path });
    Ok(commits)
}

/// List and parse log files at or after `start`.
pub(crate) async fn list_log_files(
    store: &dyn LogStore,
    start: Version,
    table_path: &str,
) -> Result<Vec<ParsedLogPath>, LogError> {
    let files = store
        .list_from(&log_path::listing_prefix(start))
        .await
        .context(StorageSnafu { table_path })?;
    Ok(files.into_iter().filter_map(ParsedLogPath::try_parse).collect())
}

/// Newest complete checkpoint at or below `target`, skipping `excluded`.
pub(crate) fn select_checkpoint(
    listed: &[ParsedLogPath],
    target: Option<Version>,
    excluded: &BTreeSet<Version>,
) -> Option<CheckpointFiles> {
    let mut by_version: BTreeMap<Version, Vec<&ParsedLogPath>> = BTreeMap::new();
    for p in listed.iter().filter(|p| p.is_checkpoint()) {
        if target.is_none_or(|t| p.version <= t) && !excluded.contains(&p.version) {
            by_version.entry(p.version).or_default().push(p);
        }
    }
    by_version
        .into_iter()
        .rev()
        .find_map(|(version, files)| complete_checkpoint(version, &files))
}

fn complete_checkpoint(version: Version, files: &[&ParsedLogPath]) -> Option<CheckpointFiles> {
    if let Some(classic) = files.iter().find(|p| p.kind == LogPathKind::Checkpoint) {
        return Some(CheckpointFiles {
            version,
            parts: vec![classic.file.clone()],
        });
    }

    let mut by_count: BTreeMap<u32, BTreeMap<u32, &FileMeta>> = BTreeMap::new();
    for p in files {
        if let LogPathKind::CheckpointPart { part, parts } = p.kind {
            by_count.entry(parts).or_default().insert(part, &p.file);
        }
    }
    by_count.into_iter().find_map(|(parts, found)| {
        let complete = (1..=parts).all(|i| found.contains_key(&i));
        complete.then(|| CheckpointFiles {
            version,
            parts: found.into_values().cloned().collect(),
        })
    })
}

fn missing_history(
    table_path: String,
    listed: &[ParsedLogPath],
    target: Option<Version>,
    expected: Version,
    found: Option<Version>,
) -> LogError {
    if let (Some(version), Some(earliest)) = (target, earliest_reconstructable(listed)) {
        if version < earliest {
            return VersionNotAvailableSnafu {
                table_path,
                version,
                earliest,
            }
            .build();
        }
    }
    match found {
        Some(found) => VersionGapSnafu {
            table_path,
            expected,
            found,
        }
        .build(),
        None => TableNotFoundSnafu { table_path }.build(),
    }
}

fn earliest_reconstructable(listed: &[ParsedLogPath]) -> Option<Version> {
    let excluded = BTreeSet::new();
    let mut checkpoints: BTreeSet<Version> = BTreeSet::new();
    for p in listed.iter().filter(|p| p.is_checkpoint()) {
        checkpoints.insert(p.version);
    }
    let earliest_checkpoint = checkpoints
        .into_iter()
        .find(|v| select_checkpoint(listed, Some(*v), &excluded).is_some_and(|c| c.version == *v));
    let has_commit_zero = listed.iter().any(|p| p.is_commit() && p.version == 0);
    if has_commit_zero {
        Some(0)
    } else {
        earliest_checkpoint
    }
}

async fn probe(
    store: &dyn LogStore,
    version: Version,
    table_path: &str,
) -> Result<Option<ParsedLogPath>, LogError> {
    match store.head(&log_path::commit_path(version)).await {
        Ok(file) => Ok(ParsedLogPath::try_parse(file)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e).context(StorageSnafu { table_path }),
    }
}

async fn fill_listing_holes(
    store: &dyn LogStore,
    commits: &mut Vec<ParsedLogPath>,
    table_path: &str,
) -> Result<(), LogError> {
    let (Some(first), Some(last)) = (commits.first(), commits.last()) else {
        return Ok(());
    };
    let (first, last) = (first.version, last.version);
    if last - first + 1 == commits.len() as Version {
        return Ok(());
    }

    let present: BTreeSet<Version> = commits.iter().map(|c| c.version).collect();
    for version in first..=last {
        if present.contains(&version) {
            continue;
        }
        if let Some(found) = probe(store, version, table_path).await? {
            warn!("commit {version} of {table_path} missing from listing; found by direct lookup");
            commits.push(found);
        }
    }
    commits.sort_by_key(|c| c.version);
    Ok(())
}

async fn probe_tail(
    store: &dyn LogStore,
    commits: &mut Vec<ParsedLogPath>,
    checkpoint_version: Option<Version>,
    target: Option<Version>,
    table_path: &str,
) -> Result<(), LogError> {
    loop {
        let next = match commits.last().map(|c| c.version).or(checkpoint_version) {
            Some(v) => v + 1,
            None => 0,
        };
        if target.is_some_and(|t| next > t) {
            return Ok(());
        }
        match probe(store, next, table_path).await? {
            Some(found) => {
                if next > 0 || !commits.is_empty() {
                    warn!("commit {next} of {table_path} missing from listing; found by direct lookup");
                }
                commits.push(found);
            }
            None => return Ok(()),
        }
    }
}
