//! Storage abstraction underneath the transaction log.
//!
//! The engine never touches data file bytes; everything it persists lives under
//! the table's `_delta_log/` directory and is accessed through the [`LogStore`]
//! trait defined here. Implementations must provide:
//!
//! - Ordered listing of log files starting at a name prefix (`list_from`).
//! - Whole-file reads.
//! - Writes with **create-only-if-absent** semantics when `overwrite == false`.
//!   Concurrent writers racing for the same path must see exactly one success;
//!   this is the only mutual exclusion the commit protocol relies on.
//! - A direct existence probe (`head`) that is read-after-write consistent even
//!   when listing is not (object stores).
//! - Deletion, used only by retention cleanup.
//!
//! Two backends ship with the crate: [`LocalLogStore`] for local filesystems and
//! [`MemoryLogStore`] for tests and embedded use.

mod error;
mod local;
mod memory;
mod table_location;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use error::{BackendError, StorageError};
pub(crate) use error::{AlreadyExistsSnafu, AmbiguousSnafu, NotFoundSnafu, OtherIoSnafu};
pub use local::LocalLogStore;
pub use memory::{InjectedFailure, MemoryLogStore};
pub use table_location::TableLocation;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A file entry returned by [`LogStore::list_from`] and [`LogStore::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Path relative to the table root, using `/` separators
    /// (for example `_delta_log/00000000000000000003.json`).
    pub path: String,
    /// Size of the file in bytes.
    pub size: u64,
    /// Last modification time reported by the backend.
    pub last_modified: DateTime<Utc>,
}

impl FileMeta {
    /// File name component of [`FileMeta::path`].
    pub fn file_name(&self) -> &str {
        file_name(&self.path)
    }
}

/// Return the last `/`-separated component of a relative path.
pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Return the directory part (without trailing `/`) of a relative path.
pub(crate) fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Interface the transaction log engine requires from the underlying storage.
///
/// All paths are relative to the table root and use `/` separators.
#[async_trait]
pub trait LogStore: Send + Sync + fmt::Debug {
    /// Root location of the table this store serves. Used in error messages
    /// and as the key of the snapshot cache.
    fn location(&self) -> &TableLocation;

    /// List the files that live in the same directory as `start` and whose
    /// file name sorts at or after the file name of `start`, ordered by name.
    ///
    /// Because commit and checkpoint names are zero-padded, name order is also
    /// version order. A missing directory yields an empty listing. Callers
    /// resume a listing by calling again with the last name they saw.
    ///
    /// Backends with eventually consistent listings may omit recently written
    /// files; callers must confirm absence with [`LogStore::head`].
    async fn list_from(&self, start: &str) -> StorageResult<Vec<FileMeta>>;

    /// Read the full contents of `path`.
    async fn read(&self, path: &str) -> StorageResult<Bytes>;

    /// Write `contents` to `path`.
    ///
    /// With `overwrite == false` the write must be atomic create-if-absent and
    /// return [`StorageError::AlreadyExists`] if the path exists. With
    /// `overwrite == true` readers must observe either the old or the new
    /// contents, never a torn file.
    async fn write(&self, path: &str, contents: Bytes, overwrite: bool) -> StorageResult<()>;

    /// Look up a single file. Must not depend on listing consistency.
    async fn head(&self, path: &str) -> StorageResult<FileMeta>;

    /// Delete `path`. Deleting a missing file returns [`StorageError::NotFound`].
    async fn delete(&self, path: &str) -> StorageResult<()>;
}
