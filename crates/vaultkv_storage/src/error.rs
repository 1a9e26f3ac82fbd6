//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A store document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The handle refers to a store this backend never opened.
    #[error("unknown store: {name}")]
    UnknownStore {
        /// The store name carried by the handle.
        name: String,
    },

    /// The store name cannot be used by this backend.
    #[error("invalid store name: {name:?}")]
    InvalidStoreName {
        /// The rejected name.
        name: String,
    },

    /// The persisted store is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A failure injected by a test harness.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StorageError {
    /// Creates an unknown store error.
    pub fn unknown_store(name: impl Into<String>) -> Self {
        Self::UnknownStore { name: name.into() }
    }

    /// Creates an invalid store name error.
    pub fn invalid_store_name(name: impl Into<String>) -> Self {
        Self::InvalidStoreName { name: name.into() }
    }
}
