//! Folding log actions into table state.
//!
//! [`ReplayState`] is the mutable accumulator used while a snapshot is being
//! built. It starts empty (version "-1"), optionally absorbs a checkpoint, then
//! absorbs each commit in ascending version order:
//!
//! - `metaData` / `protocol`: last one wins.
//! - `add`: inserts or replaces the live entry for its path and clears any
//!   tombstone for that path.
//! - `remove`: drops the live entry and records the tombstone.
//! - `txn`: keeps the highest version per application id.
//! - `domainMetadata`: keeps the latest entry per domain; `removed` deletes it.
//! - `commitInfo`: only its timestamp is remembered.
//!
//! Within a batch actions are applied in order, so a commit that removes and
//! re-adds the same path ends with the file live.

use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::{
    Version,
    actions::{Action, AddFile, CommitInfo, DomainMetadata, Metadata, Protocol, RemoveFile, SetTransaction},
};

use super::{LogError, VersionGapSnafu};

/// Accumulated table state during log replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayState {
    /// Last version applied; `None` before anything was applied.
    pub version: Option<Version>,
    /// Live protocol.
    pub protocol: Option<Protocol>,
    /// Live metadata.
    pub metadata: Option<Metadata>,
    /// Live files keyed by path.
    pub files: BTreeMap<String, AddFile>,
    /// Tombstones keyed by path.
    pub tombstones: BTreeMap<String, RemoveFile>,
    /// Highest `txn` version per application id.
    pub set_transactions: BTreeMap<String, SetTransaction>,
    /// Live domains keyed by name.
    pub domain_metadata: BTreeMap<String, DomainMetadata>,
    /// Provenance of the last commit applied, if it carried any.
    pub last_commit_info: Option<CommitInfo>,
    /// Timestamp (ms) of the last version applied.
    pub last_timestamp: Option<i64>,
}

impl ReplayState {
    /// Empty state at version "-1".
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the state from checkpoint actions.
    ///
    /// A checkpoint already holds folded state, so its actions are applied
    /// without the contiguity check. The state must be empty.
    pub fn apply_checkpoint(
        &mut self,
        version: Version,
        actions: impl IntoIterator<Item = Action>,
        checkpoint_timestamp: i64,
    ) {
        debug_assert!(self.version.is_none(), "checkpoint applied to non-empty state");
        for action in actions {
            self.apply_action(action);
        }
        self.version = Some(version);
        self.last_commit_info = None;
        self.last_timestamp = Some(checkpoint_timestamp);
    }

    /// Apply one commit. `version` must directly follow the last applied one.
    ///
    /// `file_timestamp` is the commit file's modification time, used when the
    /// commit carries no timestamp of its own.
    pub fn apply_commit(
        &mut self,
        table_path: &str,
        version: Version,
        actions: impl IntoIterator<Item = Action>,
        file_timestamp: i64,
    ) -> Result<(), LogError> {
        let expected = self.next_version();
        ensure!(
            version == expected,
            VersionGapSnafu {
                table_path,
                expected,
                found: version,
            }
        );

        self.last_commit_info = None;
        for action in actions {
            self.apply_action(action);
        }
        self.version = Some(version);
        self.last_timestamp = Some(
            self.last_commit_info
                .as_ref()
                .and_then(CommitInfo::commit_timestamp)
                .unwrap_or(file_timestamp),
        );
        Ok(())
    }

    /// Version the next commit must have.
    pub fn next_version(&self) -> Version {
        self.version.map_or(0, |v| v + 1)
    }

    fn apply_action(&mut self, action: Action) {
        match action {
            Action::Add(add) => {
                self.tombstones.remove(&add.path);
                self.files.insert(add.path.clone(), add);
            }
            Action::Remove(remove) => {
                self.files.remove(&remove.path);
                self.tombstones.insert(remove.path.clone(), remove);
            }
            Action::Metadata(metadata) => self.metadata = Some(metadata),
            Action::Protocol(protocol) => self.protocol = Some(protocol),
            Action::Txn(txn) => {
                let newer = self
                    .set_transactions
                    .get(&txn.app_id)
                    .is_none_or(|prev| txn.version > prev.version);
                if newer {
                    self.set_transactions.insert(txn.app_id.clone(), txn);
                }
            }
            Action::DomainMetadata(domain) => {
                if domain.removed {
                    self.domain_metadata.remove(&domain.domain);
                } else {
                    self.domain_metadata.insert(domain.domain.clone(), domain);
                }
            }
            Action::CommitInfo(info) => self.last_commit_info = Some(info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn add(path: &str) -> AddFile {
        AddFile::new(path, BTreeMap::new(), 10, 1, true)
    }

    fn txn(app: &str, version: i64) -> Action {
        Action::Txn(SetTransaction {
            app_id: app.to_string(),
            version,
            last_updated: None,
        })
    }

    #[test]
    fn later_actions_win_within_and_across_commits() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = ReplayState::new();
        state.apply_commit(
            "t",
            0,
            vec![
                Action::Protocol(Protocol::legacy(1, 2)),
                Action::Add(add("a")),
                Action::Add(add("b")),
            ],
            100,
        )?;
        let a = add("a");
        state.apply_commit(
            "t",
            1,
            vec![
                Action::Remove(a.remove_with(5, true)),
                Action::Add(a.clone().with_num_records(3)),
                Action::Remove(add("b").remove_with(5, true)),
                Action::Protocol(Protocol::legacy(1, 3)),
            ],
            200,
        )?;

        assert_eq!(state.version, Some(1));
        assert_eq!(state.files.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(state.files["a"].num_records(), Some(3));
        assert!(!state.tombstones.contains_key("a"));
        assert!(state.tombstones.contains_key("b"));
        assert_eq!(state.protocol, Some(Protocol::legacy(1, 3)));
        assert_eq!(state.last_timestamp, Some(200));
        Ok(())
    }

    #[test]
    fn txn_keeps_highest_version_per_app() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = ReplayState::new();
        state.apply_commit("t", 0, vec![txn("app", 5), txn("other", 1)], 1)?;
        state.apply_commit("t", 1, vec![txn("app", 3)], 2)?;
        assert_eq!(state.set_transactions["app"].version, 5);
        assert_eq!(state.set_transactions["other"].version, 1);
        Ok(())
    }

    #[test]
    fn removed_domain_disappears() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = ReplayState::new();
        state.apply_commit(
            "t",
            0,
            vec![Action::DomainMetadata(DomainMetadata::new("app", "{\"k\":1}"))],
            1,
        )?;
        assert!(state.domain_metadata.contains_key("app"));
        let mut removed = DomainMetadata::new("app", "");
        removed.removed = true;
        state.apply_commit("t", 1, vec![Action::DomainMetadata(removed)], 2)?;
        assert!(state.domain_metadata.is_empty());
        Ok(())
    }

    #[test]
    fn commit_info_timestamp_preferred_over_file_time() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = ReplayState::new();
        let info = CommitInfo {
            timestamp: Some(10),
            in_commit_timestamp: Some(42),
            ..CommitInfo::default()
        };
        state.apply_commit("t", 0, vec![Action::CommitInfo(info)], 99)?;
        assert_eq!(state.last_timestamp, Some(42));
        state.apply_commit("t", 1, vec![], 123)?;
        assert_eq!(state.last_timestamp, Some(123));
        assert!(state.last_commit_info.is_none());
        Ok(())
    }

    #[test]
    fn gap_is_rejected() {
        let mut state = ReplayState::new();
        let err = state
            .apply_commit("t", 1, Vec::new(), 0)
            .expect_err("must start at 0");
        assert!(matches!(err, LogError::VersionGap { expected: 0, found: 1, .. }));
    }

    #[test]
    fn checkpoint_seeds_version() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = ReplayState::new();
        state.apply_checkpoint(9, vec![Action::Add(add("x"))], 50);
        assert_eq!(state.next_version(), 10);
        state.apply_commit("t", 10, vec![Action::Remove(add("x").remove_with(1, true))], 60)?;
        assert!(state.files.is_empty());
        Ok(())
    }

    #[test]
    fn replay_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let batches = vec![
            vec![Action::Add(add("a")), txn("app", 1)],
            vec![Action::Remove(add("a").remove_with(3, true)), Action::Add(add("b"))],
        ];
        let fold = || -> Result<ReplayState, LogError> {
            let mut s = ReplayState::new();
            for (v, batch) in batches.iter().enumerate() {
                s.apply_commit("t", v as Version, batch.clone(), 7)?;
            }
            Ok(s)
        };
        assert_eq!(fold()?, fold()?);
        Ok(())
    }
}
