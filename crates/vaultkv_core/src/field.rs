//! Property-style access to a single key.

use crate::coordinator::Settled;
use crate::error::VaultResult;
use crate::vault::Vault;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// A property-style handle on one key of a [`Vault`].
///
/// `assign` and `unset` return immediately and never fail: their outcome is
/// only logged. Use [`Vault::set`] and [`Vault::remove`] to observe errors.
///
/// ```rust
/// use vaultkv_core::Vault;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let vault = Vault::open_in_memory().await.unwrap();
/// let theme = vault.field("theme");
///
/// theme.assign("dark");
/// assert_eq!(theme.read().await.unwrap(), Some("dark".into()));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Field {
    vault: Vault,
    key: String,
}

impl Field {
    pub(crate) fn new(vault: Vault, key: String) -> Self {
        Self { vault, key }
    }

    /// Returns the key this field addresses.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Writes `value` in the background.
    ///
    /// A read issued after this call observes `value` even before the write
    /// reaches the backend.
    pub fn assign(&self, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(value) => self.vault.assign(self.key.clone(), value),
            Err(err) => warn!(key = %self.key, error = %err, "value not serializable; ignored"),
        }
    }

    /// Deletes the key in the background.
    pub fn unset(&self) {
        self.vault.unset(self.key.clone());
    }

    /// Reads the current value.
    ///
    /// If a write or delete of this key is in flight, its outcome is the
    /// result. While a clear is in flight the read waits for it and then
    /// reads fresh state. A pending write that failed is skipped and the
    /// stored value is read instead.
    pub fn read(&self) -> BoxFuture<'static, VaultResult<Option<Value>>> {
        let view = self.vault.coordinator().read_view(&self.key);
        let vault = self.vault.clone();
        let key = self.key.clone();
        async move {
            match view.latest() {
                Some(pending) => match pending.await {
                    Settled::Written(value) => return Ok(Some(value)),
                    Settled::Removed => return Ok(None),
                    Settled::Failed => {}
                },
                None => view.settle().await,
            }
            vault.read_direct(key).await
        }
        .boxed()
    }
}
