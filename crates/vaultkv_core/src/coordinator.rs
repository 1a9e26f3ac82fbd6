//! Pending-operation coordinator.
//!
//! Orders key-scoped mutations per key and serializes them against
//! whole-store clears.
//!
//! # Invariants
//!
//! - At most one pending entry per key. A new mutation on a key chains after
//!   the entry it replaces, so mutations on one key run in issue order.
//! - A mutation issued while a clear barrier is set starts after the barrier.
//! - A clear starts only after every mutation pending at issue time settled.
//! - Entries are registered at issue time, before any work starts, and are
//!   removed once they settle, whether the work succeeded or not.
//!
//! Entries are identified by an issue counter. A settling entry removes
//! itself only if it is still the registered one, so a newer entry on the
//! same key (or a newer barrier) is never dropped early.
//!
//! While an entry's work runs, its issue id is held in a task-local. Views
//! captured from inside that work leave out the running entry and every
//! entry issued after it, since those may be waiting on the running one.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

tokio::task_local! {
    static RUNNING: u64;
}

/// Returns the issue id of the entry whose work is running on this task.
fn running() -> Option<u64> {
    RUNNING.try_with(|id| *id).ok()
}

/// True if a view captured now may wait on the entry issued as `id`.
fn visible(id: u64, running: Option<u64>) -> bool {
    running.map_or(true, |running| id < running)
}

/// How a pending mutation settled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
    /// The value was written.
    Written(Value),
    /// The key was removed.
    Removed,
    /// The mutation failed or was abandoned.
    Failed,
}

pub(crate) type PendingFuture = Shared<BoxFuture<'static, Settled>>;
pub(crate) type BarrierFuture = Shared<BoxFuture<'static, ()>>;

#[derive(Clone)]
pub(crate) struct Slot<F> {
    pub(crate) id: u64,
    pub(crate) future: F,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: HashMap<String, Slot<PendingFuture>>,
    barrier: Option<Slot<BarrierFuture>>,
}

impl State {
    fn issue(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// What a key-scoped read must wait for, captured when the read is issued.
pub(crate) struct ReadView {
    pub(crate) barrier: Option<Slot<BarrierFuture>>,
    pub(crate) pending: Option<Slot<PendingFuture>>,
}

impl ReadView {
    /// Returns the pending mutation if it was issued after the barrier, so
    /// its outcome is the freshest state of the key.
    pub(crate) fn latest(&self) -> Option<PendingFuture> {
        let pending = self.pending.as_ref()?;
        match &self.barrier {
            Some(barrier) if barrier.id > pending.id => None,
            _ => Some(pending.future.clone()),
        }
    }

    /// Waits until everything captured in the view has settled.
    pub(crate) async fn settle(self) {
        if let Some(barrier) = self.barrier {
            barrier.future.await;
        }
        if let Some(pending) = self.pending {
            pending.future.await;
        }
    }
}

/// Everything a store-wide read must wait for.
pub(crate) struct SettledView {
    barrier: Option<BarrierFuture>,
    pending: Vec<PendingFuture>,
}

impl SettledView {
    /// Waits until the barrier and every captured mutation settled.
    pub(crate) async fn settle(self) {
        if let Some(barrier) = self.barrier {
            barrier.await;
        }
        future::join_all(self.pending).await;
    }
}

/// Per-vault registry of pending mutations and the clear barrier.
#[derive(Default)]
pub(crate) struct Coordinator {
    state: Arc<Mutex<State>>,
}

impl Coordinator {
    /// Registers a mutation on `key` and returns its shared future.
    ///
    /// The returned future runs `work` once the previous entry for `key`
    /// and any clear barrier settled. Nothing runs until it is polled.
    pub(crate) fn enqueue_write<W>(&self, key: &str, work: W) -> PendingFuture
    where
        W: Future<Output = Settled> + Send + 'static,
    {
        let mut state = self.state.lock();
        let id = state.issue();
        let prior = state.pending.get(key).map(|slot| slot.future.clone());
        let barrier = state.barrier.as_ref().map(|slot| slot.future.clone());

        let registry = Arc::clone(&self.state);
        let owned_key = key.to_owned();
        let future = async move {
            if let Some(barrier) = barrier {
                barrier.await;
            }
            if let Some(prior) = prior {
                prior.await;
            }
            // A panicking extension must not poison the shared future.
            let settled = RUNNING
                .scope(id, AssertUnwindSafe(work).catch_unwind())
                .await
                .unwrap_or(Settled::Failed);

            let mut state = registry.lock();
            if state.pending.get(&owned_key).is_some_and(|slot| slot.id == id) {
                state.pending.remove(&owned_key);
            }
            settled
        }
        .boxed()
        .shared();

        state.pending.insert(
            key.to_owned(),
            Slot {
                id,
                future: future.clone(),
            },
        );
        future
    }

    /// Registers a clear and returns its barrier future.
    ///
    /// `work` runs after every mutation pending at this call settled.
    pub(crate) fn enqueue_clear<W>(&self, work: W) -> BarrierFuture
    where
        W: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        let id = state.issue();
        let outstanding: Vec<PendingFuture> =
            state.pending.values().map(|slot| slot.future.clone()).collect();
        let prior = state.barrier.as_ref().map(|slot| slot.future.clone());

        let registry = Arc::clone(&self.state);
        let future = async move {
            if let Some(prior) = prior {
                prior.await;
            }
            future::join_all(outstanding).await;
            let _ = RUNNING
                .scope(id, AssertUnwindSafe(work).catch_unwind())
                .await;

            let mut state = registry.lock();
            state.pending.retain(|_, slot| slot.id > id);
            if state.barrier.as_ref().is_some_and(|slot| slot.id == id) {
                state.barrier = None;
            }
        }
        .boxed()
        .shared();

        state.barrier = Some(Slot {
            id,
            future: future.clone(),
        });
        future
    }

    /// Captures what a read of `key` issued now must observe.
    pub(crate) fn read_view(&self, key: &str) -> ReadView {
        let running = running();
        let state = self.state.lock();
        ReadView {
            barrier: state
                .barrier
                .clone()
                .filter(|slot| visible(slot.id, running)),
            pending: state
                .pending
                .get(key)
                .filter(|slot| visible(slot.id, running))
                .cloned(),
        }
    }

    /// Captures what a store-wide read issued now must observe.
    pub(crate) fn settled_view(&self) -> SettledView {
        let running = running();
        let state = self.state.lock();
        SettledView {
            barrier: state
                .barrier
                .as_ref()
                .filter(|slot| visible(slot.id, running))
                .map(|slot| slot.future.clone()),
            pending: state
                .pending
                .values()
                .filter(|slot| visible(slot.id, running))
                .map(|slot| slot.future.clone())
                .collect(),
        }
    }

    /// Returns the number of keys with a pending mutation.
    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true while a clear is in flight.
    pub(crate) fn has_barrier(&self) -> bool {
        self.state.lock().barrier.is_some()
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coordinator")
            .field("pending", &state.pending.len())
            .field("barrier", &state.barrier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn log_write(
        log: &Arc<Mutex<Vec<String>>>,
        label: &str,
        delay_ms: u64,
        settled: Settled,
    ) -> impl Future<Output = Settled> + Send + 'static {
        let log = Arc::clone(log);
        let label = label.to_owned();
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().push(label);
            settled
        }
    }

    #[tokio::test]
    async fn same_key_runs_in_issue_order() {
        let coordinator = Coordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = coordinator.enqueue_write("k", log_write(&log, "first", 30, Settled::Written(json!(1))));
        let fast = coordinator.enqueue_write("k", log_write(&log, "second", 0, Settled::Written(json!(2))));
        tokio::spawn(slow);
        assert_eq!(coordinator.pending_len(), 1);

        assert_eq!(fast.await, Settled::Written(json!(2)));
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_wait() {
        let coordinator = Coordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = coordinator.enqueue_write("a", log_write(&log, "a", 50, Settled::Removed));
        let fast = coordinator.enqueue_write("b", log_write(&log, "b", 0, Settled::Removed));
        tokio::spawn(slow.clone());

        fast.await;
        assert_eq!(*log.lock(), vec!["b"]);
        slow.await;
        assert_eq!(*log.lock(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn clear_waits_for_pending_and_gates_later_writes() {
        let coordinator = Coordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let before = coordinator.enqueue_write("k", log_write(&log, "write-before", 30, Settled::Removed));
        let clear_log = Arc::clone(&log);
        let barrier = coordinator.enqueue_clear(async move {
            clear_log.lock().push("clear".to_owned());
        });
        assert!(coordinator.has_barrier());
        let after = coordinator.enqueue_write("j", log_write(&log, "write-after", 0, Settled::Removed));

        tokio::spawn(before);
        tokio::spawn(barrier.clone());
        after.await;

        assert_eq!(*log.lock(), vec!["write-before", "clear", "write-after"]);
        assert!(!coordinator.has_barrier());
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn failed_work_still_releases_entry() {
        let coordinator = Coordinator::default();
        let future = coordinator.enqueue_write("k", async { Settled::Failed });
        assert_eq!(future.await, Settled::Failed);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn panicking_work_settles_as_failed() {
        let coordinator = Coordinator::default();
        let future = coordinator.enqueue_write("k", async {
            Option::<Settled>::None.expect("extension bug")
        });

        assert_eq!(future.clone().await, Settled::Failed);
        // The shared future stays usable for later readers.
        assert_eq!(future.await, Settled::Failed);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn read_view_prefers_writes_issued_after_barrier() {
        let coordinator = Coordinator::default();
        let (tx, rx) = oneshot::channel::<()>();

        let barrier = coordinator.enqueue_clear(async move {
            let _ = rx.await;
        });
        tokio::spawn(barrier);
        let write = coordinator.enqueue_write("k", async { Settled::Written(json!("new")) });
        tokio::spawn(write);

        let view = coordinator.read_view("k");
        let latest = view.latest().unwrap();
        tx.send(()).unwrap();
        assert_eq!(latest.await, Settled::Written(json!("new")));
    }

    #[tokio::test]
    async fn views_from_running_work_leave_out_it_and_later_entries() {
        let coordinator = Arc::new(Coordinator::default());
        let (tx, rx) = oneshot::channel::<(usize, bool, bool)>();

        let earlier = coordinator.enqueue_write("other", async { Settled::Removed });
        let inner = Arc::clone(&coordinator);
        let running = coordinator.enqueue_write("k", async move {
            let view = inner.read_view("k");
            let settled = inner.settled_view();
            let _ = tx.send((
                settled.pending.len(),
                settled.barrier.is_some(),
                view.pending.is_some() || view.barrier.is_some(),
            ));
            tokio::time::timeout(Duration::from_secs(2), settled.settle())
                .await
                .expect("view waited on its own work");
            Settled::Removed
        });
        let later = coordinator.enqueue_write("k", async { Settled::Removed });
        let barrier = coordinator.enqueue_clear(async {});

        tokio::spawn(earlier);
        tokio::spawn(barrier.clone());
        assert_eq!(running.clone().await, Settled::Removed);

        // Only the write issued before the running one stays visible.
        assert_eq!(rx.await.unwrap(), (1, false, false));
        later.await;
        barrier.await;
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn views_outside_running_work_see_everything() {
        let coordinator = Coordinator::default();
        let _write = coordinator.enqueue_write("k", async { Settled::Removed });
        let _barrier = coordinator.enqueue_clear(async {});

        let view = coordinator.read_view("k");
        assert!(view.pending.is_some());
        assert!(view.barrier.is_some());
        assert_eq!(coordinator.settled_view().pending.len(), 1);
    }

    #[tokio::test]
    async fn read_view_skips_writes_issued_before_barrier() {
        let coordinator = Coordinator::default();
        let write = coordinator.enqueue_write("k", async { Settled::Written(json!("old")) });
        let barrier = coordinator.enqueue_clear(async {});

        let view = coordinator.read_view("k");
        assert!(view.latest().is_none());

        tokio::spawn(write);
        tokio::spawn(barrier);
        view.settle().await;
        assert!(!coordinator.has_barrier());
    }
}
