//! In-memory storage backend for testing.

use crate::backend::{Record, StorageBackend, StoreHandle};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Store = BTreeMap<String, Record>;

/// An in-memory storage backend.
///
/// This backend stores all records in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral vaults that don't need persistence
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across tasks. No lock is
/// held across an await point; every call completes without suspending.
///
/// # Example
///
/// ```rust
/// use vaultkv_storage::{InMemoryBackend, StorageBackend};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = InMemoryBackend::new();
/// let store = backend.open("cache").await.unwrap();
/// assert_eq!(backend.count(&store).await.unwrap(), 0);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    stores: RwLock<HashMap<String, Store>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record in the named store.
    ///
    /// Useful for testing and debugging: this is the raw stored form,
    /// before any middleware transformation is reversed.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Vec<Record> {
        self.stores
            .read()
            .get(name)
            .map(|store| store.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the names of all opened stores.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn with_store<R>(&self, handle: &StoreHandle, f: impl FnOnce(&Store) -> R) -> StorageResult<R> {
        let stores = self.stores.read();
        let store = stores
            .get(handle.name())
            .ok_or_else(|| StorageError::unknown_store(handle.name()))?;
        Ok(f(store))
    }

    fn with_store_mut<R>(
        &self,
        handle: &StoreHandle,
        f: impl FnOnce(&mut Store) -> R,
    ) -> StorageResult<R> {
        let mut stores = self.stores.write();
        let store = stores
            .get_mut(handle.name())
            .ok_or_else(|| StorageError::unknown_store(handle.name()))?;
        Ok(f(store))
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn open(&self, name: &str) -> StorageResult<StoreHandle> {
        self.stores.write().entry(name.to_owned()).or_default();
        Ok(StoreHandle::new(name))
    }

    async fn get(&self, store: &StoreHandle, key: &str) -> StorageResult<Option<Record>> {
        self.with_store(store, |s| s.get(key).cloned())
    }

    async fn put(&self, store: &StoreHandle, record: Record) -> StorageResult<()> {
        self.with_store_mut(store, |s| {
            s.insert(record.key.clone(), record);
        })
    }

    async fn delete(&self, store: &StoreHandle, key: &str) -> StorageResult<()> {
        self.with_store_mut(store, |s| {
            s.remove(key);
        })
    }

    async fn clear(&self, store: &StoreHandle) -> StorageResult<()> {
        self.with_store_mut(store, BTreeMap::clear)
    }

    async fn keys(&self, store: &StoreHandle) -> StorageResult<Vec<String>> {
        self.with_store(store, |s| s.keys().cloned().collect())
    }

    async fn count(&self, store: &StoreHandle) -> StorageResult<u64> {
        self.with_store(store, |s| s.len() as u64)
    }
}
