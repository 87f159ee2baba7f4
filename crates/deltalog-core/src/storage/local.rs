use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, prelude::*};
use tokio::{fs, io::AsyncWriteExt};

use super::{
    BackendError, FileMeta, LogStore, NotFoundSnafu, OtherIoSnafu, StorageError, StorageResult,
    TableLocation, file_name, parent_dir,
};

/// [`LogStore`] backed by a directory on the local filesystem.
///
/// Create-if-absent writes stage the payload in a hidden temporary file and
/// publish it with `hard_link`, which fails atomically when the target exists.
/// Readers therefore never observe a partially written commit.
#[derive(Debug, Clone)]
pub struct LocalLogStore {
    location: TableLocation,
    root: PathBuf,
}

impl LocalLogStore {
    /// Create a store rooted at `root` (the table directory, not `_delta_log`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            location: TableLocation::Local(root.clone()),
            root,
        }
    }

    /// Table root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |acc, c| acc.join(c))
    }
}

fn classify(path: String, e: io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort; the caller is already reporting the real failure.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn temp_path_for(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

async fn write_temp(tmp_path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = fs::File::create(tmp_path)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;
    Ok(())
}

fn meta_from(path: String, md: &std::fs::Metadata) -> FileMeta {
    let last_modified = md
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    FileMeta {
        path,
        size: md.len(),
        last_modified,
    }
}

#[async_trait]
impl LogStore for LocalLogStore {
    fn location(&self) -> &TableLocation {
        &self.location
    }

    async fn list_from(&self, start: &str) -> StorageResult<Vec<FileMeta>> {
        let dir_rel = parent_dir(start);
        let start_name = file_name(start);
        let dir_abs = self.abs(dir_rel);

        let mut entries = match fs::read_dir(&dir_abs).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(classify(dir_abs.display().to_string(), e)),
        };

        let mut out = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(classify(dir_abs.display().to_string(), e)),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            // Hidden files are in-flight temporaries.
            if name.starts_with('.') || name.as_str() < start_name {
                continue;
            }
            let md = match entry.metadata().await {
                Ok(md) => md,
                // Deleted between readdir and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(classify(entry.path().display().to_string(), e)),
            };
            if !md.is_file() {
                continue;
            }
            let rel = if dir_rel.is_empty() {
                name
            } else {
                format!("{dir_rel}/{name}")
            };
            out.push(meta_from(rel, &md));
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let abs = self.abs(path);
        match fs::read(&abs).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::Local(e)).context(NotFoundSnafu { path })
            }
            Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path }),
        }
    }

    async fn write(&self, path: &str, contents: Bytes, overwrite: bool) -> StorageResult<()> {
        let abs = self.abs(path);
        create_parent_dir(&abs).await?;

        let tmp_path = temp_path_for(&abs);
        let mut guard = TempFileGuard::new(tmp_path.clone());
        write_temp(&tmp_path, &contents).await?;

        if overwrite {
            fs::rename(&tmp_path, &abs)
                .await
                .map_err(|e| classify(path.to_string(), e))?;
            guard.disarm();
        } else {
            // hard_link refuses to replace an existing target, giving us an
            // atomic create-if-absent. The guard removes the temp name either way.
            fs::hard_link(&tmp_path, &abs)
                .await
                .map_err(|e| classify(path.to_string(), e))?;
        }
        Ok(())
    }

    async fn head(&self, path: &str) -> StorageResult<FileMeta> {
        let abs = self.abs(path);
        let md = fs::metadata(&abs)
            .await
            .map_err(|e| classify(path.to_string(), e))?;
        Ok(meta_from(path.to_string(), &md))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let abs = self.abs(path);
        fs::remove_file(&abs)
            .await
            .map_err(|e| classify(path.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_create_new_then_read() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());

        store
            .write("_delta_log/a.json", Bytes::from_static(b"hello"), false)
            .await?;
        let read_back = store.read("_delta_log/a.json").await?;
        assert_eq!(&read_back[..], b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn write_create_new_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());

        store
            .write("_delta_log/a.json", Bytes::from_static(b"first"), false)
            .await?;
        let err = store
            .write("_delta_log/a.json", Bytes::from_static(b"second"), false)
            .await
            .expect_err("expected AlreadyExists error");
        assert!(err.is_already_exists());

        let read_back = store.read("_delta_log/a.json").await?;
        assert_eq!(&read_back[..], b"first");
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_replaces_contents_and_leaves_no_temp_files() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());

        store
            .write("_delta_log/_last_checkpoint", Bytes::from_static(b"v1"), true)
            .await?;
        store
            .write("_delta_log/_last_checkpoint", Bytes::from_static(b"v2"), true)
            .await?;
        assert_eq!(
            &store.read("_delta_log/_last_checkpoint").await?[..],
            b"v2"
        );

        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(tmp.path().join("_delta_log")).await?;
        while let Some(entry) = rd.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["_last_checkpoint".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());
        let err = store
            .read("_delta_log/missing.json")
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_from_is_sorted_and_starts_at_prefix() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());
        for name in ["003.json", "001.json", "002.json", "000.json"] {
            store
                .write(&format!("_delta_log/{name}"), Bytes::from_static(b"{}"), false)
                .await?;
        }

        let listed = store.list_from("_delta_log/001").await?;
        let names: Vec<_> = listed.iter().map(|f| f.file_name().to_string()).collect();
        assert_eq!(names, vec!["001.json", "002.json", "003.json"]);
        assert_eq!(listed[0].path, "_delta_log/001.json");
        assert_eq!(listed[0].size, 2);
        Ok(())
    }

    #[tokio::test]
    async fn list_from_missing_directory_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());
        assert!(store.list_from("_delta_log/0").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn head_and_delete() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LocalLogStore::new(tmp.path());
        store
            .write("_delta_log/x.json", Bytes::from_static(b"abc"), false)
            .await?;

        let meta = store.head("_delta_log/x.json").await?;
        assert_eq!(meta.size, 3);

        store.delete("_delta_log/x.json").await?;
        let err = store
            .head("_delta_log/x.json")
            .await
            .expect_err("expected NotFound after delete");
        assert!(err.is_not_found());
        Ok(())
    }
}
