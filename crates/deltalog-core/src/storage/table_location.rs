use std::{fmt, path::PathBuf};

/// Represents the root location of a table.
///
/// This enum abstracts over the storage backends shipped with the crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableLocation {
    /// A table stored on the local filesystem at the given path.
    Local(PathBuf),
    /// A table held by a [`crate::storage::MemoryLogStore`], identified by name.
    Memory(String),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Creates a new in-memory `TableLocation`.
    pub fn memory(name: impl Into<String>) -> Self {
        TableLocation::Memory(name.into())
    }

    /// Parse a user-facing location string.
    ///
    /// `memory://<name>` selects the in-memory backend, `file://<path>` or a
    /// plain path selects the local filesystem.
    pub fn parse(spec: &str) -> Self {
        if let Some(name) = spec.strip_prefix("memory://") {
            TableLocation::Memory(name.to_string())
        } else if let Some(path) = spec.strip_prefix("file://") {
            TableLocation::Local(PathBuf::from(path))
        } else {
            TableLocation::Local(PathBuf::from(spec))
        }
    }
}

impl fmt::Display for TableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLocation::Local(root) => write!(f, "file://{}", root.display()),
            TableLocation::Memory(name) => write!(f, "memory://{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_schemes() {
        assert_eq!(
            TableLocation::parse("memory://t1"),
            TableLocation::Memory("t1".to_string())
        );
        assert_eq!(
            TableLocation::parse("file:///tmp/t"),
            TableLocation::Local(PathBuf::from("/tmp/t"))
        );
        assert_eq!(
            TableLocation::parse("/data/t"),
            TableLocation::Local(PathBuf::from("/data/t"))
        );
    }

    #[test]
    fn display_is_stable_cache_key() {
        let loc = TableLocation::local("/data/events");
        assert_eq!(loc.to_string(), "file:///data/events");
        assert_eq!(TableLocation::memory("x").to_string(), "memory://x");
    }
}
