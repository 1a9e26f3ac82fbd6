//! # vaultkv Storage
//!
//! Storage backend trait and implementations for vaultkv.
//!
//! This crate provides the lowest-level storage abstraction for vaultkv.
//! Backends are **named record stores**: each store maps string keys to a
//! [`Record`] holding a JSON value and optional metadata. Backends do not
//! interpret values; encryption, validation and eventing live above them.
//!
//! ## Design Principles
//!
//! - Every call is individually atomic and durable on success
//! - No cross-call transactions are assumed or offered
//! - Must be `Send + Sync` for use from Tokio tasks
//! - Absent keys are `Ok(None)`, never an error
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - One JSON document per store, rewritten atomically
//!
//! ## Example
//!
//! ```rust
//! use vaultkv_storage::{InMemoryBackend, Record, StorageBackend};
//!
//! # tokio_test_block(async {
//! let backend = InMemoryBackend::new();
//! let store = backend.open("settings").await.unwrap();
//! backend.put(&store, Record::new("theme", "dark".into(), None)).await.unwrap();
//! let record = backend.get(&store, "theme").await.unwrap().unwrap();
//! assert_eq!(record.value, "dark");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{Record, StorageBackend, StoreHandle};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
