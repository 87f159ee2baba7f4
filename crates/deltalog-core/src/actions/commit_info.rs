use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provenance written as the first line of every commit (`commitInfo` action).
///
/// All fields are optional on read because other writers populate different
/// subsets. Keys this type does not model are preserved in
/// [`CommitInfo::other`] and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Monotonic commit timestamp when in-commit timestamps are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_commit_timestamp: Option<i64>,
    /// Wall-clock time of the commit in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Operation name, such as `WRITE` or `CREATE TABLE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Operation-specific parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_parameters: Option<BTreeMap<String, Value>>,
    /// Version the writer read before committing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
    /// Isolation level the writer validated against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<String>,
    /// True when the commit only added files without reading the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_blind_append: Option<bool>,
    /// Counters describing the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_metrics: Option<BTreeMap<String, Value>>,
    /// Free-form user annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<String>,
    /// Engine name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_info: Option<String>,
    /// Unique id of the transaction, used to recognize our own commit after an
    /// ambiguous write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl CommitInfo {
    /// Effective commit time: the in-commit timestamp when present, otherwise
    /// the wall-clock timestamp.
    pub fn commit_timestamp(&self) -> Option<i64> {
        self.in_commit_timestamp.or(self.timestamp)
    }

    /// Whether the writer declared a blind append. Missing means no.
    pub fn is_blind_append(&self) -> bool {
        self.is_blind_append.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_survive_a_round_trip() -> Result<(), serde_json::Error> {
        let json = r#"{"timestamp":5,"operation":"MERGE","clusterId":"abc","notebook":{"id":"1"}}"#;
        let ci: CommitInfo = serde_json::from_str(json)?;
        assert_eq!(ci.other.len(), 2);
        let back: Value = serde_json::to_value(&ci)?;
        assert_eq!(back["clusterId"], "abc");
        assert_eq!(back["notebook"]["id"], "1");
        Ok(())
    }

    #[test]
    fn in_commit_timestamp_wins() {
        let ci = CommitInfo {
            timestamp: Some(10),
            in_commit_timestamp: Some(20),
            ..Default::default()
        };
        assert_eq!(ci.commit_timestamp(), Some(20));
        assert!(!ci.is_blind_append());
    }
}
