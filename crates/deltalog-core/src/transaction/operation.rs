//! Operation descriptors recorded in `commitInfo`.

use std::collections::BTreeMap;

use serde_json::Value;

/// How a write treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add files alongside existing ones.
    Append,
    /// Replace existing files.
    Overwrite,
}

impl WriteMode {
    fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Append => "Append",
            WriteMode::Overwrite => "Overwrite",
        }
    }
}

/// The kind of change a commit makes.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Table creation.
    CreateTable {
        /// Partition columns of the new table.
        partition_by: Vec<String>,
    },
    /// Data write.
    Write {
        /// Append or overwrite.
        mode: WriteMode,
        /// Optional replace predicate, rendered.
        predicate: Option<String>,
    },
    /// Row deletion.
    Delete {
        /// Deletion predicate, rendered.
        predicate: Option<String>,
    },
    /// Row update.
    Update {
        /// Update predicate, rendered.
        predicate: Option<String>,
    },
    /// Merge into the table.
    Merge {
        /// Merge condition, rendered.
        predicate: String,
    },
    /// File compaction without data change.
    Optimize,
    /// Table property change.
    SetTableProperties {
        /// Properties set.
        properties: BTreeMap<String, String>,
    },
    /// Schema change.
    ChangeSchema,
    /// Explicit protocol upgrade.
    UpgradeProtocol,
    /// One micro-batch of a streaming query.
    StreamingUpdate {
        /// Output mode, such as `Append`.
        output_mode: String,
        /// Query id.
        query_id: String,
        /// Micro-batch id.
        epoch_id: i64,
    },
}

impl Operation {
    /// Name written to `commitInfo.operation`.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateTable { .. } => "CREATE TABLE",
            Operation::Write { .. } => "WRITE",
            Operation::Delete { .. } => "DELETE",
            Operation::Update { .. } => "UPDATE",
            Operation::Merge { .. } => "MERGE",
            Operation::Optimize => "OPTIMIZE",
            Operation::SetTableProperties { .. } => "SET TBLPROPERTIES",
            Operation::ChangeSchema => "CHANGE SCHEMA",
            Operation::UpgradeProtocol => "UPGRADE PROTOCOL",
            Operation::StreamingUpdate { .. } => "STREAMING UPDATE",
        }
    }

    /// Parameters written to `commitInfo.operationParameters`.
    pub fn parameters(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        let mut put = |k: &str, v: Value| {
            out.insert(k.to_string(), v);
        };
        match self {
            Operation::CreateTable { partition_by } => {
                put("partitionBy", Value::from(partition_by.clone()));
            }
            Operation::Write { mode, predicate } => {
                put("mode", Value::from(mode.as_str()));
                if let Some(p) = predicate {
                    put("predicate", Value::from(p.as_str()));
                }
            }
            Operation::Delete { predicate } | Operation::Update { predicate } => {
                if let Some(p) = predicate {
                    put("predicate", Value::from(p.as_str()));
                }
            }
            Operation::Merge { predicate } => put("predicate", Value::from(predicate.as_str())),
            Operation::SetTableProperties { properties } => {
                let map = properties
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect();
                put("properties", Value::Object(map));
            }
            Operation::StreamingUpdate {
                output_mode,
                query_id,
                epoch_id,
            } => {
                put("outputMode", Value::from(output_mode.as_str()));
                put("queryId", Value::from(query_id.as_str()));
                put("epochId", Value::from(*epoch_id));
            }
            Operation::Optimize | Operation::ChangeSchema | Operation::UpgradeProtocol => {}
        }
        out
    }
}
