//! Conflict detection between a transaction and the commits that beat it.
//!
//! When a commit attempt finds its version already taken, the winning commit is
//! checked against what this transaction read and what it is about to write.
//! A clean check means the transaction can be replayed on top of the winner at
//! the next version.
//!
//! The checks lean toward reporting a conflict: any winning metadata or
//! protocol change conflicts, a predicate over a non-partition column matches
//! every file, and a tombstone without partition values matches every
//! predicate.

use std::{collections::BTreeSet, fmt};

use crate::{
    Version,
    actions::{Action, AddFile, CommitInfo, RemoveFile},
    config::IsolationLevel,
    predicate::{PartitionColumns, Predicate},
};

/// Why a transaction could not be rebased onto a concurrent commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// The winner changed the protocol.
    ProtocolChanged,
    /// The winner changed the metadata.
    MetadataChanged,
    /// The winner added a file this transaction's reads could have seen.
    ConcurrentAppend {
        /// Added file.
        path: String,
    },
    /// The winner removed a file this transaction read.
    ConcurrentDeleteRead {
        /// Removed file.
        path: String,
    },
    /// Both transactions removed the same file.
    ConcurrentDeleteDelete {
        /// Removed file.
        path: String,
    },
    /// Both transactions recorded progress for the same application.
    ConcurrentTransaction {
        /// Application id.
        app_id: String,
    },
    /// Both transactions wrote the same user domain.
    ConcurrentDomainMetadata {
        /// Domain name.
        domain: String,
    },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::ProtocolChanged => f.write_str("the protocol was changed concurrently"),
            ConflictKind::MetadataChanged => f.write_str("the metadata was changed concurrently"),
            ConflictKind::ConcurrentAppend { path } => {
                write!(f, "file {path} was added to data this transaction read")
            }
            ConflictKind::ConcurrentDeleteRead { path } => {
                write!(f, "file {path} read by this transaction was removed")
            }
            ConflictKind::ConcurrentDeleteDelete { path } => {
                write!(f, "file {path} was removed by both transactions")
            }
            ConflictKind::ConcurrentTransaction { app_id } => {
                write!(f, "application {app_id} committed concurrently")
            }
            ConflictKind::ConcurrentDomainMetadata { domain } => {
                write!(f, "domain {domain} was written concurrently")
            }
        }
    }
}

/// A commit that took the version this transaction was attempting.
#[derive(Debug, Clone)]
pub struct WinningCommit {
    /// Version the winner holds.
    pub version: Version,
    /// The winner's actions in file order.
    pub actions: Vec<Action>,
}

impl WinningCommit {
    /// Wrap a decoded commit.
    pub fn new(version: Version, actions: Vec<Action>) -> Self {
        Self { version, actions }
    }

    /// The winner's provenance, if it wrote any.
    pub fn commit_info(&self) -> Option<&CommitInfo> {
        self.actions.iter().find_map(|a| match a {
            Action::CommitInfo(ci) => Some(ci),
            _ => None,
        })
    }

    /// Operation name recorded by the winner.
    pub fn operation(&self) -> &str {
        self.commit_info()
            .and_then(|ci| ci.operation.as_deref())
            .unwrap_or("UNKNOWN")
    }

    /// Transaction id recorded by the winner.
    pub fn txn_id(&self) -> Option<&str> {
        self.commit_info().and_then(|ci| ci.txn_id.as_deref())
    }

    fn adds(&self) -> impl Iterator<Item = &AddFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Add(add) => Some(add),
            _ => None,
        })
    }

    fn removes(&self) -> impl Iterator<Item = &RemoveFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove(remove) => Some(remove),
            _ => None,
        })
    }
}

/// What a transaction depended on while it was open.
#[derive(Debug, Clone, Default)]
pub struct ReadFootprint {
    /// Predicates passed to file listing.
    pub predicates: Vec<Predicate>,
    /// Set when the transaction depended on the whole table.
    pub whole_table: bool,
    /// Paths of files returned to the transaction.
    pub files: BTreeSet<String>,
    /// Applications whose progress the transaction looked up.
    pub app_ids: BTreeSet<String>,
}

impl ReadFootprint {
    /// True when the transaction read nothing from the table.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty() && !self.whole_table && self.files.is_empty()
    }

    fn might_have_read_add(&self, partition_columns: &PartitionColumns, add: &AddFile) -> bool {
        self.whole_table
            || self
                .predicates
                .iter()
                .any(|p| p.might_match_add(partition_columns, add))
    }

    fn might_have_read_remove(&self, partition_columns: &PartitionColumns, remove: &RemoveFile) -> bool {
        self.whole_table
            || self.files.contains(&remove.path)
            || self
                .predicates
                .iter()
                .any(|p| p.might_match_remove(partition_columns, remove))
    }
}

/// Checks winning commits against one transaction.
#[derive(Debug)]
pub(crate) struct ConflictChecker<'a> {
    pub partition_columns: &'a PartitionColumns,
    pub isolation: IsolationLevel,
    pub footprint: &'a ReadFootprint,
    pub staged: &'a [Action],
    /// The transaction stages new metadata.
    pub metadata_changed: bool,
}

impl ConflictChecker<'_> {
    /// `Ok` when this transaction can be rebased over `winner`.
    pub fn check(&self, winner: &WinningCommit) -> Result<(), ConflictKind> {
        for action in &winner.actions {
            match action {
                Action::Protocol(_) => return Err(ConflictKind::ProtocolChanged),
                Action::Metadata(_) => return Err(ConflictKind::MetadataChanged),
                _ => {}
            }
        }

        self.check_appends(winner)?;
        self.check_deletes(winner)?;
        self.check_transactions(winner)?;
        self.check_domains(winner)
    }

    fn check_appends(&self, winner: &WinningCommit) -> Result<(), ConflictKind> {
        let blind = winner.commit_info().is_some_and(CommitInfo::is_blind_append);
        // Blind appends are only invisible to writers that keep the metadata
        // those files were written against.
        if blind && self.isolation == IsolationLevel::WriteSerializable && !self.metadata_changed {
            return Ok(());
        }
        match winner
            .adds()
            .filter(|add| add.data_change)
            .find(|add| self.footprint.might_have_read_add(self.partition_columns, add))
        {
            Some(add) => Err(ConflictKind::ConcurrentAppend {
                path: add.path.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_deletes(&self, winner: &WinningCommit) -> Result<(), ConflictKind> {
        if let Some(remove) = winner
            .removes()
            .find(|r| self.footprint.might_have_read_remove(self.partition_columns, r))
        {
            return Err(ConflictKind::ConcurrentDeleteRead {
                path: remove.path.clone(),
            });
        }

        let ours: BTreeSet<&str> = self
            .staged
            .iter()
            .filter_map(|a| match a {
                Action::Remove(r) => Some(r.path.as_str()),
                _ => None,
            })
            .collect();
        match winner.removes().find(|r| ours.contains(r.path.as_str())) {
            Some(remove) => Err(ConflictKind::ConcurrentDeleteDelete {
                path: remove.path.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_transactions(&self, winner: &WinningCommit) -> Result<(), ConflictKind> {
        let mut ours: BTreeSet<&str> = self.footprint.app_ids.iter().map(String::as_str).collect();
        ours.extend(self.staged.iter().filter_map(|a| match a {
            Action::Txn(t) => Some(t.app_id.as_str()),
            _ => None,
        }));
        for action in &winner.actions {
            if let Action::Txn(t) = action {
                if ours.contains(t.app_id.as_str()) {
                    return Err(ConflictKind::ConcurrentTransaction {
                        app_id: t.app_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_domains(&self, winner: &WinningCommit) -> Result<(), ConflictKind> {
        let ours: BTreeSet<&str> = self
            .staged
            .iter()
            .filter_map(|a| match a {
                Action::DomainMetadata(d) if !d.is_system_domain() => Some(d.domain.as_str()),
                _ => None,
            })
            .collect();
        for action in &winner.actions {
            if let Action::DomainMetadata(d) = action {
                if ours.contains(d.domain.as_str()) {
                    return Err(ConflictKind::ConcurrentDomainMetadata {
                        domain: d.domain.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
