//! Change feed for observing committed mutations.
//!
//! The change feed emits one event for every successful `set`, `remove` or
//! `clear`, enabling:
//! - Reactive UI updates
//! - Cross-context synchronization layered on top (last-writer-wins by
//!   [`Version`])
//! - Audit logging
//!
//! # Usage
//!
//! ```rust,ignore
//! use vaultkv_core::Vault;
//!
//! let vault = Vault::open_in_memory().await?;
//! let mut changes = vault.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = changes.recv().await {
//!         println!("change: {event:?}");
//!     }
//! });
//!
//! vault.set("theme", "dark").await?;
//! ```

use crate::types::{Operation, Version, VersionClock};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A key was written.
    Set,
    /// A key was deleted.
    Remove,
    /// The whole store was cleared.
    Clear,
}

impl ChangeKind {
    /// Maps a mutating operation to its change kind.
    pub fn from_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Set => Some(Self::Set),
            Operation::Remove => Some(Self::Remove),
            Operation::Clear => Some(Self::Clear),
            _ => None,
        }
    }
}

/// A single change event from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Position in this vault's feed. Strictly increasing.
    pub sequence: u64,
    /// Type of change.
    pub op: ChangeKind,
    /// Affected key. `None` for [`ChangeKind::Clear`].
    pub key: Option<String>,
    /// Metadata written with a `set`, as stored.
    pub meta: Option<Value>,
    /// Write timestamp for last-writer-wins comparisons.
    pub version: Version,
}

struct History {
    next_sequence: u64,
    events: VecDeque<ChangeEvent>,
}

/// A change feed that distributes committed mutations to subscribers.
///
/// The change feed:
/// - Emits only successful mutations
/// - Assigns sequence numbers in emission order
/// - Supports multiple subscribers
/// - Is thread-safe
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<ChangeEvent>>>,
    history: Mutex<History>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a change feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: Mutex::new(History {
                next_sequence: 1,
                events: VecDeque::new(),
            }),
            max_history,
        }
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a receiver that will receive all future change events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change, assigning it the next sequence number and a version
    /// from `clock`.
    ///
    /// Both are taken under the history lock, so versions never decrease
    /// along the sequence.
    pub fn emit(
        &self,
        op: ChangeKind,
        key: Option<String>,
        meta: Option<Value>,
        clock: &VersionClock,
    ) -> ChangeEvent {
        let event = {
            let mut history = self.history.lock();
            let event = ChangeEvent {
                sequence: history.next_sequence,
                op,
                key,
                meta,
                version: clock.tick(),
            };
            history.next_sequence += 1;
            history.events.push_back(event.clone());
            while history.events.len() > self.max_history {
                history.events.pop_front();
            }
            event
        };

        // Send to subscribers (remove disconnected ones)
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        event
    }

    /// Returns events with sequence > cursor, up to limit.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .lock()
            .events
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number emitted, or 0.
    pub fn latest_sequence(&self) -> u64 {
        self.history.lock().next_sequence - 1
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of events in history.
    pub fn history_len(&self) -> usize {
        self.history.lock().events.len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_max_history(crate::config::DEFAULT_MAX_EVENT_HISTORY)
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .field("history", &self.history_len())
            .field("max_history", &self.max_history)
            .finish()
    }
}
