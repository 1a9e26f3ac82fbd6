//! Storage backend trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A single stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The key this record is stored under.
    pub key: String,
    /// The stored value. Opaque to the backend.
    pub value: Value,
    /// Optional metadata stored alongside the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Record {
    /// Creates a new record.
    pub fn new(key: impl Into<String>, value: Value, meta: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
            meta,
        }
    }
}

/// Handle to one named record store, returned by [`StorageBackend::open`].
///
/// Handles are cheap to clone and compare by store name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreHandle {
    name: Arc<str>,
}

impl StoreHandle {
    /// Creates a handle for the named store.
    ///
    /// Backends create handles in [`StorageBackend::open`]; a handle built
    /// by hand for a store that was never opened is rejected by every call.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store:{}", self.name)
    }
}

/// A persistent per-key record store.
///
/// # Invariants
///
/// - Each call is atomic: a failed `put` leaves the previous record intact
/// - A call that returns `Ok` has committed durably (as durable as the
///   backend can be; the in-memory backend only lives as long as the process)
/// - `get` of an absent key returns `Ok(None)`
/// - `delete` of an absent key and `clear` of an empty store succeed
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Opens (creating if needed) the named store.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not acceptable to the backend or
    /// existing data cannot be loaded.
    async fn open(&self, name: &str) -> StorageResult<StoreHandle>;

    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the read fails.
    async fn get(&self, store: &StoreHandle, key: &str) -> StorageResult<Option<Record>>;

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the write fails.
    async fn put(&self, store: &StoreHandle, record: Record) -> StorageResult<()>;

    /// Deletes the record stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the write fails.
    async fn delete(&self, store: &StoreHandle, key: &str) -> StorageResult<()>;

    /// Removes every record from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the write fails.
    async fn clear(&self, store: &StoreHandle) -> StorageResult<()>;

    /// Lists every key in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the read fails.
    async fn keys(&self, store: &StoreHandle) -> StorageResult<Vec<String>>;

    /// Returns the number of records in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unknown or the read fails.
    async fn count(&self, store: &StoreHandle) -> StorageResult<u64>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    async fn open(&self, name: &str) -> StorageResult<StoreHandle> {
        (**self).open(name).await
    }

    async fn get(&self, store: &StoreHandle, key: &str) -> StorageResult<Option<Record>> {
        (**self).get(store, key).await
    }

    async fn put(&self, store: &StoreHandle, record: Record) -> StorageResult<()> {
        (**self).put(store, record).await
    }

    async fn delete(&self, store: &StoreHandle, key: &str) -> StorageResult<()> {
        (**self).delete(store, key).await
    }

    async fn clear(&self, store: &StoreHandle) -> StorageResult<()> {
        (**self).clear(store).await
    }

    async fn keys(&self, store: &StoreHandle) -> StorageResult<Vec<String>> {
        (**self).keys(store).await
    }

    async fn count(&self, store: &StoreHandle) -> StorageResult<u64> {
        (**self).count(store).await
    }
}
