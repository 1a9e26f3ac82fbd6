//! The vault facade.

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
use crate::config::VaultConfig;
use crate::context::{OpResult, OperationContext};
use crate::coordinator::{Coordinator, PendingFuture, Settled};
use crate::error::{VaultError, VaultResult};
use crate::field::Field;
use crate::pipeline::{Extension, Pipeline};
use crate::types::{Operation, VersionClock};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{info, warn};
use vaultkv_storage::{InMemoryBackend, Record, StorageBackend, StoreHandle};

type Helper = Arc<dyn Any + Send + Sync>;
type Reply = oneshot::Sender<VaultResult<()>>;

/// A key-scoped mutation handed to the coordinator.
enum Mutation {
    Set { value: Value, meta: Option<Value> },
    Remove,
}

impl Mutation {
    fn operation(&self) -> Operation {
        match self {
            Self::Set { .. } => Operation::Set,
            Self::Remove => Operation::Remove,
        }
    }
}

struct VaultInner {
    config: VaultConfig,
    backend: Arc<dyn StorageBackend>,
    handle: StoreHandle,
    pipeline: Pipeline,
    coordinator: Coordinator,
    feed: ChangeFeed,
    clock: VersionClock,
    helpers: RwLock<HashMap<String, Helper>>,
}

/// An asynchronous key/value vault.
///
/// `Vault` is a cheap handle; clones share the same store, extensions and
/// pending state.
///
/// # Issue order
///
/// Every method registers its operation when it is *called*, not when the
/// returned future is first polled. Mutations run on spawned Tokio tasks and
/// settle even if the returned future is dropped. For a single key,
/// operations observe the order in which the methods were called:
///
/// ```rust
/// use vaultkv_core::Vault;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let vault = Vault::open_in_memory().await.unwrap();
/// let first = vault.set("a", 1);
/// let second = vault.set("a", 2);
/// let read = vault.get("a");
///
/// assert_eq!(read.await.unwrap(), Some(2.into()));
/// first.await.unwrap();
/// second.await.unwrap();
/// # });
/// ```
///
/// A `clear` waits for every mutation issued before it, and every operation
/// issued after it waits for the clear.
///
/// All methods must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<VaultInner>,
}

/// A non-owning reference to a [`Vault`].
///
/// Extensions that keep the vault beyond a single hook should hold one of
/// these so they do not keep the vault alive.
#[derive(Clone, Debug)]
pub struct WeakVault {
    inner: Weak<VaultInner>,
}

impl WeakVault {
    /// Returns the vault if it is still alive.
    pub fn upgrade(&self) -> Option<Vault> {
        self.inner.upgrade().map(|inner| Vault { inner })
    }
}

impl Vault {
    /// Opens a vault over the configured store of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open the store.
    pub async fn open<B: StorageBackend>(backend: B, config: VaultConfig) -> VaultResult<Self> {
        let backend: Arc<dyn StorageBackend> = Arc::new(backend);
        let handle = backend.open(&config.store_name).await?;
        info!(store = %config.store_name, "vault opened");

        Ok(Self {
            inner: Arc::new(VaultInner {
                feed: ChangeFeed::with_max_history(config.max_event_history),
                config,
                backend,
                handle,
                pipeline: Pipeline::default(),
                coordinator: Coordinator::default(),
                clock: VersionClock::new(),
                helpers: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Opens a vault over a fresh in-memory backend with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub async fn open_in_memory() -> VaultResult<Self> {
        Self::open(InMemoryBackend::new(), VaultConfig::default()).await
    }

    /// Returns the configuration this vault was opened with.
    pub fn config(&self) -> &VaultConfig {
        &self.inner.config
    }

    /// Returns a non-owning reference to this vault.
    pub fn downgrade(&self) -> WeakVault {
        WeakVault {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ---- extensions ----

    /// Registers an extension at the end of the pipeline.
    ///
    /// [`Extension::on_register`] runs first; if it fails the extension is
    /// not added. Registration order is fixed for the vault's lifetime.
    ///
    /// # Errors
    ///
    /// Returns the error from `on_register`.
    pub fn register<E: Extension>(&self, extension: E) -> VaultResult<()> {
        extension.on_register(self)?;
        let name = extension.name().to_owned();
        let position = self.inner.pipeline.push(Arc::new(extension));
        info!(extension = %name, position, "extension registered");
        Ok(())
    }

    /// Returns the names of registered extensions in registration order.
    pub fn extension_names(&self) -> Vec<String> {
        self.inner.pipeline.names()
    }

    /// Attaches an instance-level helper under `name`.
    ///
    /// Helpers live beside the vault and never reach the backend. Attaching
    /// a helper under an existing name replaces it.
    pub fn attach_helper(&self, name: impl Into<String>, helper: Arc<dyn Any + Send + Sync>) {
        self.inner.helpers.write().insert(name.into(), helper);
    }

    /// Returns the helper attached under `name` if it has type `T`.
    pub fn helper<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let helper = self.inner.helpers.read().get(name).cloned()?;
        helper.downcast::<T>().ok()
    }

    // ---- key-scoped operations ----

    /// Returns a property-style handle for `key`.
    pub fn field(&self, key: impl Into<String>) -> Field {
        Field::new(self.clone(), key.into())
    }

    /// Reads the value stored under `key`.
    ///
    /// Waits for any mutation of `key`, and any clear, issued before this
    /// call. An absent key yields `Ok(None)`.
    pub fn get(&self, key: impl Into<String>) -> BoxFuture<'static, VaultResult<Option<Value>>> {
        self.read_after_pending(Operation::Get, key.into()).boxed()
    }

    /// Reads the value under `key` and deserializes it into `T`.
    pub fn get_as<T>(&self, key: impl Into<String>) -> BoxFuture<'static, VaultResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let read = self.get(key);
        async move {
            match read.await? {
                Some(value) => Ok(Some(serde_json::from_value(value)?)),
                None => Ok(None),
            }
        }
        .boxed()
    }

    /// Reads the metadata stored beside the value under `key`.
    pub fn get_meta(&self, key: impl Into<String>) -> BoxFuture<'static, VaultResult<Option<Value>>> {
        self.read_after_pending(Operation::GetMeta, key.into()).boxed()
    }

    /// Writes `value` under `key`.
    ///
    /// The write starts after every earlier mutation of `key` settled.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> BoxFuture<'static, VaultResult<()>> {
        self.issue_set(key.into(), serde_json::to_value(value), None)
            .boxed()
    }

    /// Writes `value` with `meta` under `key`.
    pub fn set_with_meta(
        &self,
        key: impl Into<String>,
        value: impl Serialize,
        meta: Value,
    ) -> BoxFuture<'static, VaultResult<()>> {
        self.issue_set(key.into(), serde_json::to_value(value), Some(meta))
            .boxed()
    }

    /// Deletes `key`. Deleting an absent key succeeds.
    pub fn remove(&self, key: impl Into<String>) -> BoxFuture<'static, VaultResult<()>> {
        self.issue(key.into(), Mutation::Remove).boxed()
    }

    // ---- store-wide operations ----

    /// Deletes every key.
    ///
    /// Waits for every mutation issued before this call; everything issued
    /// after it waits for the clear.
    pub fn clear(&self) -> BoxFuture<'static, VaultResult<()>> {
        let (tx, rx) = oneshot::channel();
        let vault = self.clone();
        let barrier = self.inner.coordinator.enqueue_clear(async move {
            let ctx = OperationContext::new(vault.clone(), Operation::Clear, None);
            let (ctx, result) = vault.dispatch(ctx).await;
            let result = result.map(|_| vault.emit(&ctx));
            if let Err(err) = &result {
                warn!(error = %err, "clear failed");
            }
            let _ = tx.send(result);
        });
        tokio::spawn(barrier.clone());

        async move {
            barrier.await;
            rx.await
                .unwrap_or_else(|_| Err(VaultError::abandoned(Operation::Clear)))
        }
        .boxed()
    }

    /// Lists every stored key once pending mutations have settled.
    pub fn keys(&self) -> BoxFuture<'static, VaultResult<Vec<String>>> {
        let view = self.inner.coordinator.settled_view();
        let vault = self.clone();
        async move {
            view.settle().await;
            let ctx = OperationContext::new(vault.clone(), Operation::Keys, None);
            Ok(vault.dispatch(ctx).await.1?.into_keys())
        }
        .boxed()
    }

    /// Counts stored keys once pending mutations have settled.
    pub fn length(&self) -> BoxFuture<'static, VaultResult<u64>> {
        let view = self.inner.coordinator.settled_view();
        let vault = self.clone();
        async move {
            view.settle().await;
            let ctx = OperationContext::new(vault.clone(), Operation::Length, None);
            Ok(vault.dispatch(ctx).await.1?.into_length())
        }
        .boxed()
    }

    // ---- change events ----

    /// Subscribes to change events for every later successful mutation.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.inner.feed.subscribe()
    }

    /// Returns retained change events with a sequence above `cursor`.
    pub fn changes_since(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.inner.feed.poll(cursor, limit)
    }

    /// Returns the sequence number of the latest change event, or 0.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.feed.latest_sequence()
    }

    // ---- diagnostics ----

    /// Returns the number of keys with a mutation still in flight.
    pub fn pending_operations(&self) -> usize {
        self.inner.coordinator.pending_len()
    }

    /// Returns true while a clear is in flight.
    pub fn has_clear_barrier(&self) -> bool {
        self.inner.coordinator.has_barrier()
    }

    // ---- internals ----

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    /// Runs one operation through the pipeline without consulting the
    /// coordinator.
    pub(crate) async fn dispatch(
        &self,
        ctx: OperationContext,
    ) -> (OperationContext, VaultResult<OpResult>) {
        self.inner
            .pipeline
            .execute(self.inner.backend.as_ref(), &self.inner.handle, ctx)
            .await
    }

    /// Reads the stored record for `key` straight from the backend.
    pub(crate) async fn read_record(&self, key: &str) -> VaultResult<Option<Record>> {
        Ok(self.inner.backend.get(&self.inner.handle, key).await?)
    }

    /// Reads `key` directly through the pipeline.
    pub(crate) async fn read_direct(&self, key: String) -> VaultResult<Option<Value>> {
        let ctx = OperationContext::new(self.clone(), Operation::Get, Some(key));
        Ok(self.dispatch(ctx).await.1?.into_value())
    }

    fn read_after_pending(
        &self,
        operation: Operation,
        key: String,
    ) -> impl Future<Output = VaultResult<Option<Value>>> + Send + 'static {
        let view = self.inner.coordinator.read_view(&key);
        let vault = self.clone();
        async move {
            view.settle().await;
            let ctx = OperationContext::new(vault.clone(), operation, Some(key));
            Ok(vault.dispatch(ctx).await.1?.into_value())
        }
    }

    fn issue_set(
        &self,
        key: String,
        value: serde_json::Result<Value>,
        meta: Option<Value>,
    ) -> impl Future<Output = VaultResult<()>> + Send + 'static {
        let issued = value.map(|value| self.issue(key, Mutation::Set { value, meta }));
        async move { issued?.await }
    }

    fn issue(
        &self,
        key: String,
        mutation: Mutation,
    ) -> impl Future<Output = VaultResult<()>> + Send + 'static {
        let operation = mutation.operation();
        let (tx, rx) = oneshot::channel();
        let pending = self.schedule(key, mutation, Some(tx));
        async move {
            pending.await;
            rx.await
                .unwrap_or_else(|_| Err(VaultError::abandoned(operation)))
        }
    }

    /// Property-style write. Never fails; errors are logged.
    pub(crate) fn assign(&self, key: String, value: Value) {
        self.schedule(key, Mutation::Set { value, meta: None }, None);
    }

    /// Property-style delete. Never fails; errors are logged.
    pub(crate) fn unset(&self, key: String) {
        self.schedule(key, Mutation::Remove, None);
    }

    /// Registers a mutation with the coordinator and spawns its driver.
    ///
    /// With a `reply` channel the outcome goes to the caller; without one a
    /// failure is logged and swallowed.
    fn schedule(&self, key: String, mutation: Mutation, reply: Option<Reply>) -> PendingFuture {
        let vault = self.clone();
        let work_key = key.clone();
        let pending = self.inner.coordinator.enqueue_write(&key, async move {
            let operation = mutation.operation();
            let result = vault.apply(work_key.clone(), mutation).await;
            let settled = match &result {
                Ok(settled) => settled.clone(),
                Err(_) => Settled::Failed,
            };
            match reply {
                Some(tx) => {
                    let _ = tx.send(result.map(|_| ()));
                }
                None => {
                    if let Err(err) = result {
                        warn!(
                            key = %work_key,
                            operation = %operation,
                            error = %err,
                            "property-style mutation failed"
                        );
                    }
                }
            }
            settled
        });
        tokio::spawn(pending.clone());
        pending
    }

    async fn apply(&self, key: String, mutation: Mutation) -> VaultResult<Settled> {
        let ctx = OperationContext::new(self.clone(), mutation.operation(), Some(key));
        let (ctx, settled) = match mutation {
            Mutation::Set { value, meta } => (
                ctx.with_value(value.clone()).with_meta(meta),
                Settled::Written(value),
            ),
            Mutation::Remove => (ctx, Settled::Removed),
        };

        let (ctx, result) = self.dispatch(ctx).await;
        result?;
        self.emit(&ctx);
        Ok(settled)
    }

    fn emit(&self, ctx: &OperationContext) {
        if let Some(kind) = ChangeKind::from_operation(ctx.operation) {
            let meta = match kind {
                ChangeKind::Set => ctx.meta.clone(),
                _ => None,
            };
            self.inner
                .feed
                .emit(kind, ctx.key.clone(), meta, &self.inner.clock);
        }
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("store", &self.inner.handle)
            .field("pipeline", &self.inner.pipeline)
            .field("coordinator", &self.inner.coordinator)
            .field("feed", &self.inner.feed)
            .finish_non_exhaustive()
    }
}
