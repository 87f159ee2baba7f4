//! Typed access to table properties and commit options.
//!
//! Table properties live in `Metadata::configuration` as string pairs under the
//! `delta.` prefix. [`TableConfig`] borrows that map and parses individual keys
//! on demand; [`TableConfig::validate`] parses every known key at once and is
//! run before a metadata change is committed.
//!
//! | key | type | default |
//! |-----|------|---------|
//! | `delta.checkpointInterval` | positive integer | 10 |
//! | `delta.checkpoint.partSize` | positive integer | 100000 |
//! | `delta.logRetentionDuration` | interval | 30 days |
//! | `delta.deletedFileRetentionDuration` | interval | 1 week |
//! | `delta.enableExpiredLogCleanup` | boolean | true |
//! | `delta.appendOnly` | boolean | false |
//! | `delta.enableChangeDataFeed` | boolean | false |
//! | `delta.enableDeletionVectors` | boolean | false |
//! | `delta.enableRowTracking` | boolean | false |
//! | `delta.enableTypeWidening` | boolean | false |
//! | `delta.enableInCommitTimestamps` | boolean | false |
//! | `delta.columnMapping.mode` | `none` / `name` / `id` | none |
//! | `delta.columnMapping.maxColumnId` | integer | 0 |
//! | `delta.isolationLevel` | `Serializable` / `WriteSerializable` | WriteSerializable |
//! | `delta.checkpointPolicy` | `classic` / `v2` | classic |
//!
//! Intervals use the `interval <n> <unit>` syntax, for example `interval 7 days`.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use snafu::prelude::*;

/// Errors raised when a property or option is malformed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A property value cannot be parsed.
    #[snafu(display("Invalid value {value:?} for table property {key}: {reason}"))]
    InvalidProperty {
        /// Property key.
        key: String,
        /// Offending value.
        value: String,
        /// What was expected.
        reason: String,
    },

    /// Two options that exclude each other were both requested.
    #[snafu(display("Conflicting options: {detail}"))]
    ConflictingOptions {
        /// Which options conflict.
        detail: String,
    },
}

/// Property keys.
pub mod keys {
    /// Commits between checkpoints.
    pub const CHECKPOINT_INTERVAL: &str = "delta.checkpointInterval";
    /// Maximum actions per checkpoint part.
    pub const CHECKPOINT_PART_SIZE: &str = "delta.checkpoint.partSize";
    /// How long commit files are kept.
    pub const LOG_RETENTION_DURATION: &str = "delta.logRetentionDuration";
    /// How long tombstones are kept.
    pub const DELETED_FILE_RETENTION_DURATION: &str = "delta.deletedFileRetentionDuration";
    /// Whether checkpoints trigger log cleanup.
    pub const ENABLE_EXPIRED_LOG_CLEANUP: &str = "delta.enableExpiredLogCleanup";
    /// Disallow data-changing removes.
    pub const APPEND_ONLY: &str = "delta.appendOnly";
    /// Change data feed.
    pub const ENABLE_CHANGE_DATA_FEED: &str = "delta.enableChangeDataFeed";
    /// Deletion vectors.
    pub const ENABLE_DELETION_VECTORS: &str = "delta.enableDeletionVectors";
    /// Row tracking.
    pub const ENABLE_ROW_TRACKING: &str = "delta.enableRowTracking";
    /// Type widening.
    pub const ENABLE_TYPE_WIDENING: &str = "delta.enableTypeWidening";
    /// In-commit timestamps.
    pub const ENABLE_IN_COMMIT_TIMESTAMPS: &str = "delta.enableInCommitTimestamps";
    /// Column mapping mode.
    pub const COLUMN_MAPPING_MODE: &str = "delta.columnMapping.mode";
    /// Highest assigned column id.
    pub const COLUMN_MAPPING_MAX_COLUMN_ID: &str = "delta.columnMapping.maxColumnId";
    /// Isolation level for conflict checks.
    pub const ISOLATION_LEVEL: &str = "delta.isolationLevel";
    /// Checkpoint format.
    pub const CHECKPOINT_POLICY: &str = "delta.checkpointPolicy";
    /// Prefix of CHECK constraint properties.
    pub const CONSTRAINTS_PREFIX: &str = "delta.constraints.";
}

/// Which concurrent commits a transaction tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Any concurrently added file matching our reads conflicts.
    Serializable,
    /// Concurrent blind appends are tolerated.
    #[default]
    WriteSerializable,
}

impl IsolationLevel {
    /// Name as written to `commitInfo.isolationLevel`.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "Serializable",
            IsolationLevel::WriteSerializable => "WriteSerializable",
        }
    }
}

/// Column mapping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnMappingMode {
    /// Physical names equal logical names.
    #[default]
    None,
    /// Columns are resolved by physical name.
    Name,
    /// Columns are resolved by field id.
    Id,
}

/// Checkpoint format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    /// Single or multi-part parquet checkpoints.
    #[default]
    Classic,
    /// V2 checkpoints.
    V2,
}

/// Parse a boolean property value (`true`/`false`, case-insensitive).
pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse `interval <n> <unit>` (the `interval` keyword is optional).
///
/// Units: nanoseconds, microseconds, milliseconds, seconds, minutes, hours,
/// days, weeks, in singular or plural form. Sub-millisecond amounts are
/// floored to whole milliseconds.
pub fn parse_interval(value: &str) -> Option<TimeDelta> {
    let mut words = value.split_whitespace();
    let mut first = words.next()?;
    if first.eq_ignore_ascii_case("interval") {
        first = words.next()?;
    }
    let amount: i64 = first.parse().ok()?;
    let unit = words.next()?.to_ascii_lowercase();
    if words.next().is_some() || amount < 0 {
        return None;
    }
    let unit = unit.strip_suffix('s').unwrap_or(&unit);
    match unit {
        "nanosecond" => TimeDelta::try_milliseconds(amount / 1_000_000),
        "microsecond" => TimeDelta::try_milliseconds(amount / 1_000),
        "millisecond" => TimeDelta::try_milliseconds(amount),
        "second" => TimeDelta::try_seconds(amount),
        "minute" => TimeDelta::try_minutes(amount),
        "hour" => TimeDelta::try_hours(amount),
        "day" => TimeDelta::try_days(amount),
        "week" => TimeDelta::try_weeks(amount),
        _ => None,
    }
}

/// Read-only typed view over a table's properties.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig<'a> {
    properties: &'a BTreeMap<String, String>,
}

impl<'a> TableConfig<'a> {
    /// Wrap a property map.
    pub fn new(properties: &'a BTreeMap<String, String>) -> Self {
        Self { properties }
    }

    fn get<T>(
        &self,
        key: &str,
        default: T,
        reason: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T, ConfigError> {
        match self.properties.get(key) {
            None => Ok(default),
            Some(value) => parse(value.trim()).context(InvalidPropertySnafu {
                key,
                value: value.as_str(),
                reason,
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        self.get(key, default, "expected true or false", parse_bool)
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        self.get(key, default, "expected a positive integer", |v| {
            v.parse::<u64>().ok().filter(|n| *n > 0)
        })
    }

    fn interval(&self, key: &str, default: TimeDelta) -> Result<TimeDelta, ConfigError> {
        self.get(
            key,
            default,
            "expected an interval such as 'interval 7 days'",
            parse_interval,
        )
    }

    /// `delta.checkpointInterval`
    pub fn checkpoint_interval(&self) -> Result<u64, ConfigError> {
        self.positive(keys::CHECKPOINT_INTERVAL, 10)
    }

    /// `delta.checkpoint.partSize`
    pub fn checkpoint_part_size(&self) -> Result<u64, ConfigError> {
        self.positive(keys::CHECKPOINT_PART_SIZE, 100_000)
    }

    /// `delta.logRetentionDuration`
    pub fn log_retention(&self) -> Result<TimeDelta, ConfigError> {
        self.interval(keys::LOG_RETENTION_DURATION, TimeDelta::days(30))
    }

    /// `delta.deletedFileRetentionDuration`
    pub fn deleted_file_retention(&self) -> Result<TimeDelta, ConfigError> {
        self.interval(keys::DELETED_FILE_RETENTION_DURATION, TimeDelta::weeks(1))
    }

    /// `delta.enableExpiredLogCleanup`
    pub fn expired_log_cleanup_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_EXPIRED_LOG_CLEANUP, true)
    }

    /// `delta.appendOnly`
    pub fn append_only(&self) -> Result<bool, ConfigError> {
        self.flag(keys::APPEND_ONLY, false)
    }

    /// `delta.enableChangeDataFeed`
    pub fn change_data_feed_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_CHANGE_DATA_FEED, false)
    }

    /// `delta.enableDeletionVectors`
    pub fn deletion_vectors_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_DELETION_VECTORS, false)
    }

    /// `delta.enableRowTracking`
    pub fn row_tracking_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_ROW_TRACKING, false)
    }

    /// `delta.enableTypeWidening`
    pub fn type_widening_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_TYPE_WIDENING, false)
    }

    /// `delta.enableInCommitTimestamps`
    pub fn in_commit_timestamps_enabled(&self) -> Result<bool, ConfigError> {
        self.flag(keys::ENABLE_IN_COMMIT_TIMESTAMPS, false)
    }

    /// `delta.columnMapping.mode`
    pub fn column_mapping_mode(&self) -> Result<ColumnMappingMode, ConfigError> {
        self.get(
            keys::COLUMN_MAPPING_MODE,
            ColumnMappingMode::None,
            "expected none, name or id",
            |v| match v.to_ascii_lowercase().as_str() {
                "none" => Some(ColumnMappingMode::None),
                "name" => Some(ColumnMappingMode::Name),
                "id" => Some(ColumnMappingMode::Id),
                _ => None,
            },
        )
    }

    /// `delta.columnMapping.maxColumnId`
    pub fn column_mapping_max_column_id(&self) -> Result<i64, ConfigError> {
        self.get(
            keys::COLUMN_MAPPING_MAX_COLUMN_ID,
            0,
            "expected a non-negative integer",
            |v| v.parse::<i64>().ok().filter(|n| *n >= 0),
        )
    }

    /// `delta.isolationLevel`
    pub fn isolation_level(&self) -> Result<IsolationLevel, ConfigError> {
        self.get(
            keys::ISOLATION_LEVEL,
            IsolationLevel::default(),
            "expected Serializable or WriteSerializable",
            |v| match v {
                "Serializable" => Some(IsolationLevel::Serializable),
                "WriteSerializable" => Some(IsolationLevel::WriteSerializable),
                _ => None,
            },
        )
    }

    /// `delta.checkpointPolicy`
    pub fn checkpoint_policy(&self) -> Result<CheckpointPolicy, ConfigError> {
        self.get(
            keys::CHECKPOINT_POLICY,
            CheckpointPolicy::default(),
            "expected classic or v2",
            |v| match v.to_ascii_lowercase().as_str() {
                "classic" => Some(CheckpointPolicy::Classic),
                "v2" => Some(CheckpointPolicy::V2),
                _ => None,
            },
        )
    }

    /// CHECK constraints declared as `delta.constraints.<name>` properties.
    pub fn check_constraints(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.properties.iter().filter_map(|(k, v)| {
            k.strip_prefix(keys::CONSTRAINTS_PREFIX)
                .map(|name| (name, v.as_str()))
        })
    }

    /// Lenient boolean lookup: anything other than a parseable `true` is false.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(|v| parse_bool(v.trim()))
            .unwrap_or(false)
    }

    /// Parse every known key, reporting the first malformed value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.checkpoint_interval()?;
        self.checkpoint_part_size()?;
        self.log_retention()?;
        self.deleted_file_retention()?;
        self.expired_log_cleanup_enabled()?;
        self.append_only()?;
        self.change_data_feed_enabled()?;
        self.deletion_vectors_enabled()?;
        self.row_tracking_enabled()?;
        self.type_widening_enabled()?;
        self.in_commit_timestamps_enabled()?;
        self.column_mapping_mode()?;
        self.column_mapping_max_column_id()?;
        self.isolation_level()?;
        self.checkpoint_policy()?;
        Ok(())
    }
}

/// Options that shape a single commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOptions {
    /// Rebase attempts after losing a race before giving up.
    pub max_retries: u32,
    /// Written to `commitInfo.engineInfo`.
    pub engine_info: String,
    /// Write a checkpoint when the committed version is a multiple of the
    /// checkpoint interval.
    pub checkpoint_after_commit: bool,
    /// Overrides `delta.isolationLevel` for this transaction.
    pub isolation_level: Option<IsolationLevel>,
    /// Written to `commitInfo.userMetadata`.
    pub user_metadata: Option<String>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            engine_info: concat!("deltalog/", env!("CARGO_PKG_VERSION")).to_string(),
            checkpoint_after_commit: true,
            isolation_level: None,
            user_metadata: None,
        }
    }
}
