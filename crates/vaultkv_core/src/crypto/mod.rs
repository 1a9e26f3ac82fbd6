//! Value encryption for vaultkv.
//!
//! This module provides an [`Extension`](crate::Extension) that seals values
//! with AES-256-GCM before they reach the backend and opens them on read.
//! It is available with the `encryption` feature (on by default).
//!
//! ## Security Model
//!
//! - Uses AES-256-GCM for authenticated encryption
//! - Unique random nonce per seal
//! - Keys are derived from a password and salt with scrypt
//! - Derived keys are cached in memory only and never persisted
//! - Raw key bytes and passwords are zeroized on drop
//!
//! ## Usage
//!
//! ```ignore
//! use vaultkv_core::crypto::{provider_fn, Credential, EncryptionConfig, EncryptionExtension};
//!
//! // One credential for every key.
//! let fixed = EncryptionExtension::with_credential(
//!     Credential::new(password, "app-salt"),
//!     EncryptionConfig::new(),
//! );
//!
//! // A credential per key, with up to 64 derived keys cached.
//! let per_key = EncryptionExtension::with_provider(
//!     provider_fn(|key| lookup_credential(key)),
//!     EncryptionConfig::new().per_key_cache_capacity(64),
//! );
//! ```

mod cipher;
mod extension;
mod key_cache;

pub use cipher::{Credential, DerivedKey, KdfParams, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use extension::{
    provider_fn, CredentialProvider, EncryptionConfig, EncryptionExtension, FnProvider,
    ENVELOPE_TAG, ENVELOPE_VERSION, KEY_CACHE_HELPER,
};
pub use key_cache::{CacheEntryInfo, CredentialIdentity, KeyCache, KeyCacheStats};
