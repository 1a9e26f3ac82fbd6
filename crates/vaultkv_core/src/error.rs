//! Error types for vaultkv core.

use crate::types::Operation;
use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Coarse classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An extension vetoed the operation before the backend was touched.
    Validation,
    /// A key could not be derived from a credential.
    CryptoDerivation,
    /// A value could not be sealed.
    CryptoSeal,
    /// A value could not be opened (wrong key or corrupted ciphertext).
    CryptoOpen,
    /// The storage backend failed.
    BackendIo,
    /// A value could not be converted to or from JSON.
    Serialization,
    /// An extension failed for its own reasons.
    Extension,
    /// The operation was malformed.
    InvalidOperation,
    /// The operation ended without reporting an outcome.
    Abandoned,
}

/// Errors that can occur in vault operations.
///
/// Reading an absent key is not an error; it yields `Ok(None)`.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] vaultkv_storage::StorageError),

    /// JSON conversion error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An extension vetoed the operation.
    #[error("validation failed: {message}")]
    Validation {
        /// Why the operation was rejected.
        message: String,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {message}")]
    KeyDerivation {
        /// Description of the failure.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// An extension hook failed.
    #[error("extension `{extension}` failed: {message}")]
    Extension {
        /// Name of the failing extension.
        extension: String,
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in its current form.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The task driving the operation stopped before reporting an outcome.
    #[error("{operation} operation abandoned before it settled")]
    Abandoned {
        /// The abandoned operation.
        operation: Operation,
    },
}

impl VaultError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a key derivation error.
    pub fn key_derivation(message: impl Into<String>) -> Self {
        Self::KeyDerivation {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an extension error.
    pub fn extension(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extension {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an abandoned operation error.
    pub fn abandoned(operation: Operation) -> Self {
        Self::Abandoned { operation }
    }

    /// Returns the error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) => ErrorKind::BackendIo,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::KeyDerivation { .. } => ErrorKind::CryptoDerivation,
            Self::EncryptionFailed { .. } => ErrorKind::CryptoSeal,
            Self::DecryptionFailed { .. } => ErrorKind::CryptoOpen,
            Self::Extension { .. } => ErrorKind::Extension,
            Self::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            Self::Abandoned { .. } => ErrorKind::Abandoned,
        }
    }
}
