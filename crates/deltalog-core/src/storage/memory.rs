use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use super::{
    AlreadyExistsSnafu, AmbiguousSnafu, BackendError, FileMeta, LogStore, NotFoundSnafu,
    OtherIoSnafu, StorageResult, TableLocation, file_name, parent_dir,
};

/// A failure to inject into the next write of a given path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// The write is not applied and fails with a retryable I/O error.
    Transient,
    /// The write is applied but the caller sees an ambiguous outcome.
    AmbiguousApplied,
    /// The write is not applied and the caller sees an ambiguous outcome.
    AmbiguousLost,
}

#[derive(Debug, Clone)]
struct Entry {
    contents: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, Entry>,
    write_order: VecDeque<String>,
    listing_lag: usize,
    failures: HashMap<String, InjectedFailure>,
}

/// In-process [`LogStore`].
///
/// Besides serving as a fast backend for tests, it can emulate object-store
/// behavior: listings that lag behind writes ([`MemoryLogStore::set_listing_lag`])
/// and writes whose outcome is unknown ([`MemoryLogStore::inject_failure`]).
#[derive(Debug)]
pub struct MemoryLogStore {
    location: TableLocation,
    inner: Mutex<Inner>,
}

impl MemoryLogStore {
    /// Create an empty store identified by `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            location: TableLocation::Memory(name.into()),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hide the `lag` most recently written files from `list_from`.
    /// `head` and `read` still see them.
    pub fn set_listing_lag(&self, lag: usize) {
        self.lock().listing_lag = lag;
    }

    /// Fail the next write to `path` in the given way.
    pub fn inject_failure(&self, path: impl Into<String>, failure: InjectedFailure) {
        self.lock().failures.insert(path.into(), failure);
    }

    /// Override the modification time of an existing file.
    pub fn set_last_modified(&self, path: &str, at: DateTime<Utc>) -> bool {
        match self.lock().files.get_mut(path) {
            Some(entry) => {
                entry.last_modified = at;
                true
            }
            None => false,
        }
    }

    /// All stored paths, in name order.
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }
}

fn store_entry(inner: &mut Inner, path: &str, contents: Bytes) {
    inner.files.insert(
        path.to_string(),
        Entry {
            contents,
            last_modified: Utc::now(),
        },
    );
    inner.write_order.retain(|p| p != path);
    inner.write_order.push_back(path.to_string());
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn location(&self) -> &TableLocation {
        &self.location
    }

    async fn list_from(&self, start: &str) -> StorageResult<Vec<FileMeta>> {
        let inner = self.lock();
        let dir = parent_dir(start);
        let start_name = file_name(start);
        let hidden: Vec<&String> = inner
            .write_order
            .iter()
            .rev()
            .take(inner.listing_lag)
            .collect();

        Ok(inner
            .files
            .range(start.to_string()..)
            .filter(|(path, _)| parent_dir(path) == dir && file_name(path) >= start_name)
            .filter(|(path, _)| !hidden.contains(path))
            .map(|(path, entry)| FileMeta {
                path: path.clone(),
                size: entry.contents.len() as u64,
                last_modified: entry.last_modified,
            })
            .collect())
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let inner = self.lock();
        match inner.files.get(path) {
            Some(entry) => Ok(entry.contents.clone()),
            None => Err(BackendError::Remote("no such key".to_string()))
                .context(NotFoundSnafu { path }),
        }
    }

    async fn write(&self, path: &str, contents: Bytes, overwrite: bool) -> StorageResult<()> {
        let mut inner = self.lock();
        let failure = inner.failures.remove(path);

        if failure == Some(InjectedFailure::Transient) {
            return Err(BackendError::Remote("injected transient failure".to_string()))
                .context(OtherIoSnafu { path });
        }
        if failure == Some(InjectedFailure::AmbiguousLost) {
            return Err(BackendError::Remote("injected timeout".to_string()))
                .context(AmbiguousSnafu { path });
        }

        if !overwrite && inner.files.contains_key(path) {
            return Err(BackendError::Remote("key exists".to_string()))
                .context(AlreadyExistsSnafu { path });
        }
        store_entry(&mut inner, path, contents);

        if failure == Some(InjectedFailure::AmbiguousApplied) {
            return Err(BackendError::Remote("injected timeout".to_string()))
                .context(AmbiguousSnafu { path });
        }
        Ok(())
    }

    async fn head(&self, path: &str) -> StorageResult<FileMeta> {
        let inner = self.lock();
        match inner.files.get(path) {
            Some(entry) => Ok(FileMeta {
                path: path.to_string(),
                size: entry.contents.len() as u64,
                last_modified: entry.last_modified,
            }),
            None => Err(BackendError::Remote("no such key".to_string()))
                .context(NotFoundSnafu { path }),
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        match inner.files.remove(path) {
            Some(_) => {
                inner.write_order.retain(|p| p != path);
                Ok(())
            }
            None => Err(BackendError::Remote("no such key".to_string()))
                .context(NotFoundSnafu { path }),
        }
    }
}
