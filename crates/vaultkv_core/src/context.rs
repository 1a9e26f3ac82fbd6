//! Operation context and results threaded through the pipeline.

use crate::error::VaultResult;
use crate::types::Operation;
use crate::vault::Vault;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::OnceCell;
use vaultkv_storage::Record;

/// The mutable state of one logical call, threaded through every hook.
///
/// Extensions may rewrite `value` and `meta` in `before` hooks and stash
/// their own fields in `extras`; the pipeline never reads or drops `extras`.
///
/// For `set`, the record stored before the write is available through
/// [`previous_value`](Self::previous_value) and
/// [`previous_meta`](Self::previous_meta). It is read from the backend on
/// first use and memoized.
pub struct OperationContext {
    /// The operation being dispatched.
    pub operation: Operation,
    /// Target key. `None` for store-wide operations.
    pub key: Option<String>,
    /// Value to write (for `set`).
    pub value: Option<Value>,
    /// Metadata to write (for `set`).
    pub meta: Option<Value>,
    /// Free-form extension fields.
    pub extras: Map<String, Value>,
    previous: OnceCell<Option<Record>>,
    vault: Vault,
}

impl OperationContext {
    /// Creates a context for `operation` on `vault`.
    pub fn new(vault: Vault, operation: Operation, key: Option<String>) -> Self {
        Self {
            operation,
            key,
            value: None,
            meta: None,
            extras: Map::new(),
            previous: OnceCell::new(),
            vault,
        }
    }

    /// Sets the value slot.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the metadata slot.
    #[must_use]
    pub fn with_meta(mut self, meta: Option<Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Returns the vault this operation runs against.
    ///
    /// Hooks may await reads through it (`get`, `get_meta`, `keys`,
    /// `length`). Such reads skip the operation the hook belongs to and
    /// everything issued after it, so they see the store as it was when the
    /// operation started. Awaiting a mutation or a clear from a hook is not
    /// supported: it may be queued behind the hook's own operation.
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Returns the value stored under the key before this `set`.
    ///
    /// `None` for an absent key and for every other operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub async fn previous_value(&self) -> VaultResult<Option<&Value>> {
        Ok(self.previous_record().await?.map(|record| &record.value))
    }

    /// Returns the metadata stored under the key before this `set`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub async fn previous_meta(&self) -> VaultResult<Option<&Value>> {
        Ok(self
            .previous_record()
            .await?
            .and_then(|record| record.meta.as_ref()))
    }

    /// Reads the pre-image now unless a hook already did.
    pub(crate) async fn load_previous(&self) -> VaultResult<()> {
        self.previous_record().await.map(|_| ())
    }

    async fn previous_record(&self) -> VaultResult<Option<&Record>> {
        let key = match (self.operation, self.key.as_deref()) {
            (Operation::Set, Some(key)) => key,
            _ => return Ok(None),
        };
        let record = self
            .previous
            .get_or_try_init(|| self.vault.read_record(key))
            .await?;
        Ok(record.as_ref())
    }

    /// Returns true if the operation affects `key`.
    ///
    /// Store-wide operations carry no key and apply to every key.
    pub fn targets(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation", &self.operation)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("meta", &self.meta)
            .field("previous", &self.previous.get())
            .field("extras", &self.extras)
            .finish_non_exhaustive()
    }
}

/// The outcome of one dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    /// Result of `get`. `None` when the key is absent.
    Value(Option<Value>),
    /// Result of `getMeta`.
    Meta(Option<Value>),
    /// Result of `keys`.
    Keys(Vec<String>),
    /// Result of `length`.
    Length(u64),
    /// Result of a mutation.
    Done,
}

impl OpResult {
    /// Returns the carried value or metadata, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) | Self::Meta(v) => v,
            _ => None,
        }
    }

    /// Returns the carried key list, or an empty list.
    pub fn into_keys(self) -> Vec<String> {
        match self {
            Self::Keys(keys) => keys,
            _ => Vec::new(),
        }
    }

    /// Returns the carried count, or 0.
    pub fn into_length(self) -> u64 {
        match self {
            Self::Length(n) => n,
            _ => 0,
        }
    }
}
