//! Process-wide latest-snapshot cache keyed by table location.
//!
//! Readers clone an `Arc<Snapshot>` out of the map and never observe a partially
//! built snapshot. Only replay produces entries, and [`SnapshotCache::publish`]
//! never replaces a newer entry with an older one.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::debug;

use crate::{log::LogError, protocol::ClientCapabilities, storage::LogStore};

use super::Snapshot;

/// Cache of the latest known snapshot per table.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, Arc<Snapshot>>>,
    capabilities: ClientCapabilities,
}

impl SnapshotCache {
    /// Empty cache that loads snapshots with `capabilities`.
    pub fn new(capabilities: ClientCapabilities) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capabilities,
        }
    }

    /// Capabilities used for every load.
    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    // Entries are replaced whole, so a poisoned map holds no partial state.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Snapshot>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Snapshot>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached snapshot for `location`, if any. Never touches storage.
    pub fn get(&self, location: &str) -> Option<Arc<Snapshot>> {
        self.read().get(location).cloned()
    }

    /// Cached snapshot for the store's table, loading the latest version when
    /// nothing is cached.
    pub async fn get_or_load(&self, store: &dyn LogStore) -> Result<Arc<Snapshot>, LogError> {
        let key = store.location().to_string();
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let loaded = Snapshot::try_new(store, None, &self.capabilities).await?;
        Ok(self.publish(Arc::new(loaded)))
    }

    /// Bring the cached snapshot up to the latest version, replaying only new
    /// commits. Loads from scratch when nothing is cached.
    pub async fn refresh(&self, store: &dyn LogStore) -> Result<Arc<Snapshot>, LogError> {
        let key = store.location().to_string();
        let Some(current) = self.get(&key) else {
            return self.get_or_load(store).await;
        };
        match current.update(store, None, &self.capabilities).await? {
            Some(next) => {
                debug!("refreshed {key} from {} to {}", current.version(), next.version());
                Ok(self.publish(Arc::new(next)))
            }
            None => Ok(current),
        }
    }

    /// Offer `snapshot` as the latest for its table.
    ///
    /// Returns whichever snapshot the cache holds afterwards: `snapshot`
    /// itself, or an already cached newer one.
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        let mut entries = self.write();
        match entries.get(snapshot.table_path()) {
            Some(existing) if existing.version() >= snapshot.version() => existing.clone(),
            _ => {
                entries.insert(snapshot.table_path().to_string(), snapshot.clone());
                snapshot
            }
        }
    }

    /// Drop the cached snapshot for `location`.
    pub fn invalidate(&self, location: &str) -> bool {
        self.write().remove(location).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{self, Action, AddFile, Metadata, Protocol},
        log_path,
        schema::{DataType, PrimitiveType, StructField, StructType},
        storage::MemoryLogStore,
    };
    use bytes::Bytes;
    use std::collections::BTreeMap;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn commit(store: &MemoryLogStore, version: u64, batch: &[Action]) -> TestResult {
        store
            .write(
                &log_path::commit_path(version),
                Bytes::from(actions::serialize_actions(batch)?),
                false,
            )
            .await?;
        Ok(())
    }

    async fn seed(store: &MemoryLogStore) -> TestResult {
        let schema = StructType::new(vec![StructField::new(
            "id",
            DataType::primitive(PrimitiveType::Long),
            true,
        )]);
        commit(
            store,
            0,
            &[
                Action::Protocol(Protocol::legacy(1, 2)),
                Action::Metadata(Metadata::try_new(&schema, vec![], BTreeMap::new())?),
            ],
        )
        .await
    }

    #[tokio::test]
    async fn refresh_is_incremental_and_monotonic() -> TestResult {
        let store = MemoryLogStore::new("cache");
        seed(&store).await?;
        let cache = SnapshotCache::default();

        let first = cache.get_or_load(&store).await?;
        assert_eq!(first.version(), 0);

        commit(
            &store,
            1,
            &[Action::Add(AddFile::new("a", BTreeMap::new(), 1, 1, true))],
        )
        .await?;
        assert_eq!(cache.get_or_load(&store).await?.version(), 0);
        let refreshed = cache.refresh(&store).await?;
        assert_eq!(refreshed.version(), 1);

        let kept = cache.publish(first.clone());
        assert_eq!(kept.version(), 1);
        assert_eq!(cache.get(&store.location().to_string()).map(|s| s.version()), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_forces_reload() -> TestResult {
        let store = MemoryLogStore::new("cache");
        seed(&store).await?;
        let cache = SnapshotCache::default();
        cache.get_or_load(&store).await?;
        let key = store.location().to_string();
        assert!(cache.invalidate(&key));
        assert!(cache.get(&key).is_none());
        assert!(!cache.invalidate(&key));
        Ok(())
    }
}
