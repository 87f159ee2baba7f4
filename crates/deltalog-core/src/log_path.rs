//! On-disk layout of the transaction log.
//!
//! This module centralizes all *relative* path conventions under a table root:
//! - the log directory (`_delta_log/`)
//! - commit file naming (`<20-digit version>.json`)
//! - checkpoint naming, single-file and multi-part
//! - the `_last_checkpoint` pointer
//!
//! Paths are returned as `/`-separated strings relative to the table root, the
//! form every [`crate::storage::LogStore`] accepts.

use crate::{Version, storage::FileMeta};

/// Name of the subdirectory containing the transaction log.
pub const LOG_DIR_NAME: &str = "_delta_log";

/// Name of the checkpoint pointer file.
pub const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";

/// Number of digits used in zero-padded version numbers.
pub const VERSION_DIGITS: usize = 20;

/// Number of digits used in zero-padded checkpoint part numbers.
pub const PART_DIGITS: usize = 10;

/// Relative path: `_delta_log/<v:020>.json`
pub fn commit_path(version: Version) -> String {
    format!("{LOG_DIR_NAME}/{version:020}.json")
}

/// Relative path: `_delta_log/<v:020>.checkpoint.parquet`
pub fn checkpoint_path(version: Version) -> String {
    format!("{LOG_DIR_NAME}/{version:020}.checkpoint.parquet")
}

/// Relative path: `_delta_log/<v:020>.checkpoint.<part:010>.<parts:010>.parquet`
pub fn checkpoint_part_path(version: Version, part: u32, parts: u32) -> String {
    format!(
        "{LOG_DIR_NAME}/{version:020}.checkpoint.{part:010}.{parts:010}.parquet"
    )
}

/// All file paths of a checkpoint with `parts` parts. One part means the
/// single-file naming.
pub fn checkpoint_paths(version: Version, parts: u32) -> Vec<String> {
    if parts <= 1 {
        vec![checkpoint_path(version)]
    } else {
        (1..=parts)
            .map(|part| checkpoint_part_path(version, part, parts))
            .collect()
    }
}

/// Relative path: `_delta_log/_last_checkpoint`
pub fn last_checkpoint_path() -> String {
    format!("{LOG_DIR_NAME}/{LAST_CHECKPOINT_FILE_NAME}")
}

/// Listing start key for files at or after `version`.
pub fn listing_prefix(version: Version) -> String {
    format!("{LOG_DIR_NAME}/{version:020}")
}

/// Kind of a recognized log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogPathKind {
    /// `<v>.json`
    Commit,
    /// `<v>.checkpoint.parquet`
    Checkpoint,
    /// `<v>.checkpoint.<part>.<parts>.parquet`
    CheckpointPart {
        /// 1-based part index.
        part: u32,
        /// Total number of parts.
        parts: u32,
    },
}

/// A listed file whose name follows one of the log naming conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogPath {
    /// Version encoded in the file name.
    pub version: Version,
    /// What kind of log file this is.
    pub kind: LogPathKind,
    /// Listing entry the name was parsed from.
    pub file: FileMeta,
}

impl ParsedLogPath {
    /// Parse a listing entry. Returns `None` for files that are not commits or
    /// checkpoints (`_last_checkpoint`, temporaries, unknown suffixes).
    pub fn try_parse(file: FileMeta) -> Option<Self> {
        let (version, kind) = parse_file_name(file.file_name())?;
        Some(Self {
            version,
            kind,
            file,
        })
    }

    /// True for commit files.
    pub fn is_commit(&self) -> bool {
        self.kind == LogPathKind::Commit
    }

    /// True for single-file or multi-part checkpoint files.
    pub fn is_checkpoint(&self) -> bool {
        !self.is_commit()
    }
}

fn parse_digits<T: std::str::FromStr>(s: &str, width: usize) -> Option<T> {
    if s.len() == width && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

/// Parse a bare log file name into its version and kind.
pub fn parse_file_name(name: &str) -> Option<(Version, LogPathKind)> {
    let mut pieces = name.split('.');
    let version: Version = parse_digits(pieces.next()?, VERSION_DIGITS)?;
    let rest: Vec<&str> = pieces.collect();
    let kind = match rest.as_slice() {
        ["json"] => LogPathKind::Commit,
        ["checkpoint", "parquet"] => LogPathKind::Checkpoint,
        ["checkpoint", part, parts, "parquet"] => {
            let part: u32 = parse_digits(part, PART_DIGITS)?;
            let parts: u32 = parse_digits(parts, PART_DIGITS)?;
            if part == 0 || part > parts {
                return None;
            }
            LogPathKind::CheckpointPart { part, parts }
        }
        _ => return None,
    };
    Some((version, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_and_checkpoint_names_are_zero_padded() {
        assert_eq!(commit_path(7), "_delta_log/00000000000000000007.json");
        assert_eq!(
            checkpoint_path(10),
            "_delta_log/00000000000000000010.checkpoint.parquet"
        );
        assert_eq!(
            checkpoint_part_path(10, 2, 3),
            "_delta_log/00000000000000000010.checkpoint.0000000002.0000000003.parquet"
        );
        assert_eq!(last_checkpoint_path(), "_delta_log/_last_checkpoint");
    }

    #[test]
    fn checkpoint_paths_switches_naming_on_part_count() {
        assert_eq!(checkpoint_paths(5, 1), vec![checkpoint_path(5)]);
        assert_eq!(checkpoint_paths(5, 2).len(), 2);
    }

    #[test]
    fn parse_recognizes_known_kinds() {
        assert_eq!(
            parse_file_name("00000000000000000003.json"),
            Some((3, LogPathKind::Commit))
        );
        assert_eq!(
            parse_file_name("00000000000000000010.checkpoint.parquet"),
            Some((10, LogPathKind::Checkpoint))
        );
        assert_eq!(
            parse_file_name("00000000000000000010.checkpoint.0000000001.0000000002.parquet"),
            Some((10, LogPathKind::CheckpointPart { part: 1, parts: 2 }))
        );
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(parse_file_name("_last_checkpoint"), None);
        assert_eq!(parse_file_name("3.json"), None);
        assert_eq!(parse_file_name("00000000000000000003.crc"), None);
        assert_eq!(parse_file_name("00000000000000000003.json.tmp"), None);
        assert_eq!(
            parse_file_name("00000000000000000010.checkpoint.0000000003.0000000002.parquet"),
            None
        );
    }
}
