//! File-based storage backend for persistent storage.

use crate::backend::{Record, StorageBackend, StoreHandle};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

type Store = BTreeMap<String, Record>;

/// Current on-disk document format.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    format_version: u32,
    records: &'a Store,
}

#[derive(Deserialize)]
struct StoreDocument {
    format_version: u32,
    records: Store,
}

/// A file-based storage backend.
///
/// Each store is kept as one JSON document `<root>/<name>.json`. Stores are
/// loaded into memory on [`open`](StorageBackend::open) and every mutation
/// rewrites the document.
///
/// # Durability
///
/// A mutation is applied to a copy of the store, written to a temporary
/// file, synced with `sync_all`, and renamed over the previous document.
/// Only after the rename succeeds does the in-memory copy change, so a
/// failed call leaves both the file and the cached store untouched.
///
/// # Thread Safety
///
/// Calls are serialized by an async mutex that is held across the write,
/// which makes each call atomic with respect to the others.
///
/// # Example
///
/// ```no_run
/// use vaultkv_storage::{FileBackend, Record, StorageBackend};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = FileBackend::open_dir("data").await.unwrap();
/// let store = backend.open("settings").await.unwrap();
/// backend.put(&store, Record::new("theme", "dark".into(), None)).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    stores: Mutex<HashMap<String, Store>>,
}

impl FileBackend {
    /// Opens a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open_dir(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the document backing the named store.
    #[must_use]
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn validate_name(name: &str) -> StorageResult<()> {
        let bad = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0']);
        if bad {
            return Err(StorageError::invalid_store_name(name));
        }
        Ok(())
    }

    async fn load(&self, name: &str) -> StorageResult<Store> {
        let path = self.store_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Store::new()),
            Err(err) => return Err(err.into()),
        };

        let document: StoreDocument = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::Corrupted(format!("{}: {err}", path.display()))
        })?;
        if document.format_version != FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "{}: unsupported format version {}",
                path.display(),
                document.format_version
            )));
        }
        Ok(document.records)
    }

    async fn persist(&self, name: &str, store: &Store) -> StorageResult<()> {
        let path = self.store_path(name);
        let tmp = self.root.join(format!("{name}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(&StoreDocumentRef {
            format_version: FORMAT_VERSION,
            records: store,
        })?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Applies `f` to a copy of the store and commits it once persisted.
    async fn mutate(&self, handle: &StoreHandle, f: impl FnOnce(&mut Store)) -> StorageResult<()> {
        let mut stores = self.stores.lock().await;
        let current = stores
            .get(handle.name())
            .ok_or_else(|| StorageError::unknown_store(handle.name()))?;

        let mut next = current.clone();
        f(&mut next);
        self.persist(handle.name(), &next).await?;
        stores.insert(handle.name().to_owned(), next);
        Ok(())
    }

    async fn read<R>(&self, handle: &StoreHandle, f: impl FnOnce(&Store) -> R) -> StorageResult<R> {
        let stores = self.stores.lock().await;
        let store = stores
            .get(handle.name())
            .ok_or_else(|| StorageError::unknown_store(handle.name()))?;
        Ok(f(store))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn open(&self, name: &str) -> StorageResult<StoreHandle> {
        Self::validate_name(name)?;

        let mut stores = self.stores.lock().await;
        if !stores.contains_key(name) {
            let store = self.load(name).await?;
            tracing::debug!(store = name, records = store.len(), "loaded file store");
            stores.insert(name.to_owned(), store);
        }
        Ok(StoreHandle::new(name))
    }

    async fn get(&self, store: &StoreHandle, key: &str) -> StorageResult<Option<Record>> {
        self.read(store, |s| s.get(key).cloned()).await
    }

    async fn put(&self, store: &StoreHandle, record: Record) -> StorageResult<()> {
        self.mutate(store, |s| {
            s.insert(record.key.clone(), record);
        })
        .await
    }

    async fn delete(&self, store: &StoreHandle, key: &str) -> StorageResult<()> {
        self.mutate(store, |s| {
            s.remove(key);
        })
        .await
    }

    async fn clear(&self, store: &StoreHandle) -> StorageResult<()> {
        self.mutate(store, BTreeMap::clear).await
    }

    async fn keys(&self, store: &StoreHandle) -> StorageResult<Vec<String>> {
        self.read(store, |s| s.keys().cloned().collect()).await
    }

    async fn count(&self, store: &StoreHandle) -> StorageResult<u64> {
        self.read(store, |s| s.len() as u64).await
    }
}
