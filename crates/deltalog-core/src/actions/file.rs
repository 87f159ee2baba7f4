use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Partition column name to serialized partition value; `None` is a null value.
pub type PartitionValues = BTreeMap<String, Option<String>>;

/// Reference to a deletion vector attached to a data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionVectorDescriptor {
    /// `u` (relative path), `i` (inline) or `p` (absolute path).
    pub storage_type: String,
    /// Location or inline payload, interpreted according to `storage_type`.
    pub path_or_inline_dv: String,
    /// Byte offset inside the referenced file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i32>,
    /// Serialized size in bytes.
    pub size_in_bytes: i32,
    /// Number of deleted rows.
    pub cardinality: i64,
}

impl DeletionVectorDescriptor {
    /// Identifier that distinguishes two vectors attached to the same file.
    pub fn unique_id(&self) -> String {
        match self.offset {
            Some(offset) => format!("{}{}@{offset}", self.storage_type, self.path_or_inline_dv),
            None => format!("{}{}", self.storage_type, self.path_or_inline_dv),
        }
    }
}

/// A data file that is part of the table (`add` action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Path relative to the table root (or absolute URI).
    pub path: String,
    /// One entry per partition column.
    #[serde(default)]
    pub partition_values: PartitionValues,
    /// File size in bytes.
    pub size: i64,
    /// Milliseconds since the epoch.
    pub modification_time: i64,
    /// False when the file only rearranges existing data (compaction).
    pub data_change: bool,
    /// JSON-encoded column statistics, including `numRecords`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    /// Rows of the file logically deleted by a deletion vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
    /// First row id of the file when row tracking is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_row_id: Option<i64>,
    /// Commit version that first added the rows when row tracking is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_row_commit_version: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsHeader {
    num_records: Option<i64>,
}

impl AddFile {
    /// Create an add action without stats or tags.
    pub fn new(
        path: impl Into<String>,
        partition_values: PartitionValues,
        size: i64,
        modification_time: i64,
        data_change: bool,
    ) -> Self {
        Self {
            path: path.into(),
            partition_values,
            size,
            modification_time,
            data_change,
            stats: None,
            tags: None,
            deletion_vector: None,
            base_row_id: None,
            default_row_commit_version: None,
        }
    }

    /// Attach a stats JSON document.
    pub fn with_stats(mut self, stats: impl Into<String>) -> Self {
        self.stats = Some(stats.into());
        self
    }

    /// Attach `{"numRecords": n}` stats.
    pub fn with_num_records(self, num_records: i64) -> Self {
        self.with_stats(format!("{{\"numRecords\":{num_records}}}"))
    }

    /// `numRecords` from the stats document, if present and parseable.
    pub fn num_records(&self) -> Option<i64> {
        let stats = self.stats.as_deref()?;
        serde_json::from_str::<StatsHeader>(stats)
            .ok()
            .and_then(|h| h.num_records)
    }

    /// Tombstone for this file, deleted now and flagged as a data change.
    pub fn remove(&self) -> RemoveFile {
        self.remove_with(crate::now_millis(), true)
    }

    /// Tombstone for this file with an explicit deletion time and data-change flag.
    ///
    /// Partition values, size, tags and row-tracking fields are carried over so
    /// conflict detection and change feeds can reason about the removed file.
    pub fn remove_with(&self, deletion_timestamp: i64, data_change: bool) -> RemoveFile {
        RemoveFile {
            path: self.path.clone(),
            deletion_timestamp: Some(deletion_timestamp),
            data_change,
            extended_file_metadata: Some(true),
            partition_values: Some(self.partition_values.clone()),
            size: Some(self.size),
            tags: self.tags.clone(),
            deletion_vector: self.deletion_vector.clone(),
            base_row_id: self.base_row_id,
            default_row_commit_version: self.default_row_commit_version,
        }
    }
}

/// A data file that is no longer part of the table (`remove` action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Path of the removed file, matching the earlier `add`.
    pub path: String,
    /// Milliseconds since the epoch; drives tombstone retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    /// False when the removal only rearranges data.
    pub data_change: bool,
    /// Whether the optional fields below were populated by the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_file_metadata: Option<bool>,
    /// Partition values of the removed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<PartitionValues>,
    /// Size of the removed file in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Tags of the removed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    /// Deletion vector of the removed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
    /// Row-tracking base id of the removed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_row_id: Option<i64>,
    /// Row-tracking commit version of the removed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_row_commit_version: Option<i64>,
}

impl RemoveFile {
    /// Deletion time, treating a missing timestamp as the epoch so that it
    /// expires first.
    pub fn deletion_timestamp_or_epoch(&self) -> i64 {
        self.deletion_timestamp.unwrap_or(0)
    }
}
