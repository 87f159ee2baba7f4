//! Log actions and commit payload encoding.
//!
//! A commit file is newline-delimited JSON: one object per line, each object
//! carrying exactly one action key (`add`, `remove`, `metaData`, `protocol`,
//! `txn`, `commitInfo`, `domainMetadata`). Lines whose only keys are unknown
//! action kinds are skipped so newer writers do not break older readers.
//!
//! The submodules own the larger action payloads; this module owns the
//! [`Action`] sum type and the line codec.

mod commit_info;
mod file;
mod metadata;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub use crate::protocol::Protocol;
pub use commit_info::CommitInfo;
pub use file::{AddFile, DeletionVectorDescriptor, PartitionValues, RemoveFile};
pub use metadata::{Format, Metadata};

/// An action recorded in a commit or checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// A data file became part of the table.
    #[serde(rename = "add")]
    Add(AddFile),
    /// A data file left the table (tombstone).
    #[serde(rename = "remove")]
    Remove(RemoveFile),
    /// Replaces the table metadata.
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    /// Replaces the protocol requirements.
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    /// Records application-level idempotency progress.
    #[serde(rename = "txn")]
    Txn(SetTransaction),
    /// Provenance for the commit. Never affects table state.
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
    /// Named configuration blob owned by a feature or application.
    #[serde(rename = "domainMetadata")]
    DomainMetadata(DomainMetadata),
}

impl Action {
    /// Data file path for `add`/`remove` actions.
    pub fn path(&self) -> Option<&str> {
        match self {
            Action::Add(add) => Some(&add.path),
            Action::Remove(remove) => Some(&remove.path),
            _ => None,
        }
    }
}

/// Idempotency marker for an external application (`txn` action).
///
/// Replay keeps, per `app_id`, the highest `version` seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTransaction {
    /// Application identifier.
    pub app_id: String,
    /// Application-defined monotonically increasing version.
    pub version: i64,
    /// Milliseconds since the epoch when the marker was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl SetTransaction {
    /// Create a marker for `app_id` at `version`, stamped with the current time.
    pub fn new(app_id: impl Into<String>, version: i64) -> Self {
        Self {
            app_id: app_id.into(),
            version,
            last_updated: Some(crate::now_millis()),
        }
    }
}

/// A named configuration blob (`domainMetadata` action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMetadata {
    /// Domain name. Names starting with `delta.` are reserved for table features.
    pub domain: String,
    /// Opaque configuration, conventionally a JSON document.
    pub configuration: String,
    /// Tombstone flag; a removed domain disappears from the snapshot.
    #[serde(default)]
    pub removed: bool,
}

impl DomainMetadata {
    /// Create a live domain entry.
    pub fn new(domain: impl Into<String>, configuration: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            configuration: configuration.into(),
            removed: false,
        }
    }

    /// Whether the domain name is reserved for table features.
    pub fn is_system_domain(&self) -> bool {
        self.domain.starts_with("delta.")
    }
}

/// Errors raised while decoding a commit file.
#[derive(Debug, Snafu)]
pub enum ActionParseError {
    /// The file is not UTF-8.
    #[snafu(display("commit is not valid UTF-8: {source}"))]
    Utf8 {
        /// Underlying decoding error.
        source: std::str::Utf8Error,
    },

    /// A line is not a valid JSON action.
    #[snafu(display("line {line}: invalid action: {source}"))]
    InvalidJson {
        /// 1-based line number.
        line: usize,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// A line populates a number of known action keys other than one.
    #[snafu(display("line {line}: expected exactly one action, found {found}"))]
    ActionCount {
        /// 1-based line number.
        line: usize,
        /// Number of known action keys found.
        found: usize,
    },
}

#[derive(Deserialize)]
struct ActionLine {
    add: Option<AddFile>,
    remove: Option<RemoveFile>,
    #[serde(rename = "metaData")]
    metadata: Option<Metadata>,
    protocol: Option<Protocol>,
    txn: Option<SetTransaction>,
    #[serde(rename = "commitInfo")]
    commit_info: Option<CommitInfo>,
    #[serde(rename = "domainMetadata")]
    domain_metadata: Option<DomainMetadata>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

impl ActionLine {
    fn into_actions(self) -> (Vec<Action>, usize) {
        let unknown = self.unknown.len();
        let actions: Vec<Action> = [
            self.add.map(Action::Add),
            self.remove.map(Action::Remove),
            self.metadata.map(Action::Metadata),
            self.protocol.map(Action::Protocol),
            self.txn.map(Action::Txn),
            self.commit_info.map(Action::CommitInfo),
            self.domain_metadata.map(Action::DomainMetadata),
        ]
        .into_iter()
        .flatten()
        .collect();
        (actions, unknown)
    }
}

/// Decode one JSON line. `Ok(None)` means the line holds only unknown action kinds.
pub fn parse_action_line(line: &str, line_no: usize) -> Result<Option<Action>, ActionParseError> {
    let parsed: ActionLine =
        serde_json::from_str(line).context(InvalidJsonSnafu { line: line_no })?;
    let (mut actions, unknown) = parsed.into_actions();
    match actions.len() {
        1 => Ok(actions.pop()),
        0 if unknown > 0 => Ok(None),
        found => ActionCountSnafu {
            line: line_no,
            found,
        }
        .fail(),
    }
}

/// Decode a whole commit file, preserving action order.
pub fn parse_actions(bytes: &[u8]) -> Result<Vec<Action>, ActionParseError> {
    let text = std::str::from_utf8(bytes).context(Utf8Snafu)?;
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(action) = parse_action_line(line, idx + 1)? {
            out.push(action);
        }
    }
    Ok(out)
}

/// Encode actions as newline-delimited JSON, one action per line.
pub fn serialize_actions(actions: &[Action]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut out, action)?;
        out.push(b'\n');
    }
    Ok(out)
}
