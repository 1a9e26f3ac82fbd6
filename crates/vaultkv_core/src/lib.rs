//! # vaultkv Core
//!
//! Coordinated asynchronous key/value vault.
//!
//! This crate provides:
//! - [`Vault`], a facade over any [`StorageBackend`](vaultkv_storage::StorageBackend)
//! - Per-key ordering of mutations, with `clear` acting as a full barrier
//! - Property-style access through [`Field`]
//! - A middleware pipeline of [`Extension`]s with before/after/error hooks
//! - A change feed of committed mutations
//! - Value encryption with cached credential-derived keys (`encryption`
//!   feature)
//!
//! ## Example
//!
//! ```rust
//! use vaultkv_core::Vault;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let vault = Vault::open_in_memory().await.unwrap();
//!
//! // Issued without awaiting; still applied in order.
//! let _ = vault.set("a", 1);
//! let _ = vault.set("a", 2);
//! assert_eq!(vault.get("a").await.unwrap(), Some(2.into()));
//!
//! let _ = vault.set("x", 1);
//! let cleared = vault.clear();
//! assert_eq!(vault.get("x").await.unwrap(), None);
//! cleared.await.unwrap();
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod context;
mod coordinator;
mod error;
mod field;
mod pipeline;
mod types;
mod vault;

#[cfg(feature = "encryption")]
pub mod crypto;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
pub use config::{VaultConfig, DEFAULT_MAX_EVENT_HISTORY, DEFAULT_STORE_NAME};
pub use context::{OpResult, OperationContext};
pub use error::{ErrorKind, VaultError, VaultResult};
pub use field::Field;
pub use pipeline::{ErrorDisposition, Extension};
pub use types::{Operation, Version, VersionClock};
pub use vault::{Vault, WeakVault};

// Re-export storage types for convenience
pub use vaultkv_storage::{FileBackend, InMemoryBackend, Record, StorageBackend, StorageError};
