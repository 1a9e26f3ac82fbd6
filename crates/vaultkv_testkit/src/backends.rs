//! Scriptable storage backend.
//!
//! [`ScriptedBackend`] wraps a real backend and lets a test delay calls,
//! fail them once, and count them. Delays are consumed in call order, which
//! makes it easy to force backend calls to complete out of issue order.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use vaultkv_storage::{
    InMemoryBackend, Record, StorageBackend, StorageError, StorageResult, StoreHandle,
};

/// A backend call kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// `open`
    Open,
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `clear`
    Clear,
    /// `keys`
    Keys,
    /// `count`
    Count,
}

#[derive(Debug, Default)]
struct Script {
    calls: usize,
    delays: VecDeque<Duration>,
    failure: Option<String>,
}

/// A backend wrapper with per-call delays, one-shot failures and counters.
#[derive(Debug)]
pub struct ScriptedBackend<B = InMemoryBackend> {
    inner: B,
    scripts: Mutex<HashMap<Call, Script>>,
}

impl ScriptedBackend<InMemoryBackend> {
    /// Wraps a fresh in-memory backend.
    pub fn new() -> Self {
        Self::wrap(InMemoryBackend::new())
    }
}

impl Default for ScriptedBackend<InMemoryBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: StorageBackend> ScriptedBackend<B> {
    /// Wraps `inner`.
    pub fn wrap(inner: B) -> Self {
        Self {
            inner,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Delays the next calls of kind `call`, one delay per call.
    pub fn delay_next(&self, call: Call, delays: impl IntoIterator<Item = Duration>) {
        self.scripts
            .lock()
            .entry(call)
            .or_default()
            .delays
            .extend(delays);
    }

    /// Makes the next call of kind `call` fail with
    /// [`StorageError::Injected`].
    pub fn fail_next(&self, call: Call, message: impl Into<String>) {
        self.scripts.lock().entry(call).or_default().failure = Some(message.into());
    }

    /// Returns how many calls of kind `call` were made.
    pub fn calls(&self, call: Call) -> usize {
        self.scripts.lock().get(&call).map_or(0, |s| s.calls)
    }

    /// Returns how many `put`, `delete` and `clear` calls were made.
    pub fn mutating_calls(&self) -> usize {
        self.calls(Call::Put) + self.calls(Call::Delete) + self.calls(Call::Clear)
    }

    async fn enter(&self, call: Call) -> StorageResult<()> {
        let (delay, failure) = {
            let mut scripts = self.scripts.lock();
            let script = scripts.entry(call).or_default();
            script.calls += 1;
            (script.delays.pop_front(), script.failure.take())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(StorageError::Injected(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for ScriptedBackend<B> {
    async fn open(&self, name: &str) -> StorageResult<StoreHandle> {
        self.enter(Call::Open).await?;
        self.inner.open(name).await
    }

    async fn get(&self, store: &StoreHandle, key: &str) -> StorageResult<Option<Record>> {
        self.enter(Call::Get).await?;
        self.inner.get(store, key).await
    }

    async fn put(&self, store: &StoreHandle, record: Record) -> StorageResult<()> {
        self.enter(Call::Put).await?;
        self.inner.put(store, record).await
    }

    async fn delete(&self, store: &StoreHandle, key: &str) -> StorageResult<()> {
        self.enter(Call::Delete).await?;
        self.inner.delete(store, key).await
    }

    async fn clear(&self, store: &StoreHandle) -> StorageResult<()> {
        self.enter(Call::Clear).await?;
        self.inner.clear(store).await
    }

    async fn keys(&self, store: &StoreHandle) -> StorageResult<Vec<String>> {
        self.enter(Call::Keys).await?;
        self.inner.keys(store).await
    }

    async fn count(&self, store: &StoreHandle) -> StorageResult<u64> {
        self.enter(Call::Count).await?;
        self.inner.count(store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn counts_calls() {
        let backend = ScriptedBackend::new();
        let store = backend.open("s").await.unwrap();
        backend.put(&store, Record::new("a", json!(1), None)).await.unwrap();
        backend.get(&store, "a").await.unwrap();
        backend.delete(&store, "a").await.unwrap();

        assert_eq!(backend.calls(Call::Open), 1);
        assert_eq!(backend.calls(Call::Get), 1);
        assert_eq!(backend.mutating_calls(), 2);
        assert_eq!(backend.calls(Call::Keys), 0);
    }

    #[tokio::test]
    async fn failure_is_one_shot() {
        let backend = ScriptedBackend::new();
        let store = backend.open("s").await.unwrap();
        backend.fail_next(Call::Put, "disk full");

        let err = backend
            .put(&store, Record::new("a", json!(1), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Injected(ref m) if m == "disk full"));
        assert!(backend.inner().snapshot("s").is_empty());

        backend.put(&store, Record::new("a", json!(1), None)).await.unwrap();
        assert_eq!(backend.inner().snapshot("s").len(), 1);
    }

    #[tokio::test]
    async fn delays_apply_in_call_order() {
        let backend = ScriptedBackend::new();
        let store = backend.open("s").await.unwrap();
        backend.delay_next(Call::Count, [Duration::from_millis(20)]);

        let start = Instant::now();
        backend.count(&store).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));

        let start = Instant::now();
        backend.count(&store).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
