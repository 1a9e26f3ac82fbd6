//! Test fixtures and vault helpers.
//!
//! Provides convenience functions for setting up test vaults and common
//! test scenarios.

use crate::backends::ScriptedBackend;
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use vaultkv_core::crypto::{Credential, EncryptionConfig, EncryptionExtension, KdfParams, KeyCache};
use vaultkv_core::{FileBackend, InMemoryBackend, Vault, VaultConfig};

/// Cheap scrypt parameters for tests. Never use outside tests.
pub const TEST_KDF: KdfParams = KdfParams::new(4, 8, 1);

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// The filter comes from `RUST_LOG`. Safe to call from every test.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A test vault over a [`ScriptedBackend`] with automatic cleanup.
pub struct TestVault<B = InMemoryBackend> {
    /// The vault instance.
    pub vault: Vault,
    /// The backend under the vault.
    pub backend: Arc<ScriptedBackend<B>>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestVault<InMemoryBackend> {
    /// Creates a vault over a scripted in-memory backend.
    pub async fn memory() -> Self {
        init_test_tracing();
        let backend = Arc::new(ScriptedBackend::new());
        let vault = Vault::open(Arc::clone(&backend), VaultConfig::default())
            .await
            .expect("Failed to open in-memory vault");
        Self {
            vault,
            backend,
            temp_dir: None,
        }
    }

    /// Returns the raw stored value of `key`, bypassing every extension.
    pub fn raw(&self, key: &str) -> Option<serde_json::Value> {
        self.backend
            .inner()
            .snapshot(&self.vault.config().store_name)
            .into_iter()
            .find(|r| r.key == key)
            .map(|r| r.value)
    }
}

impl TestVault<FileBackend> {
    /// Creates a vault over a scripted file backend in a temporary
    /// directory.
    pub async fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::open_file(temp_dir).await
    }

    /// Drops the vault and opens a new one over the same directory.
    pub async fn reopen(self) -> Self {
        let temp_dir = self.temp_dir.expect("File vault should have a directory");
        drop(self.vault);
        Self::open_file(temp_dir).await
    }

    /// Returns the backend root directory.
    pub fn path(&self) -> &Path {
        self.backend.inner().root()
    }

    async fn open_file(temp_dir: TempDir) -> Self {
        init_test_tracing();
        let inner = FileBackend::open_dir(temp_dir.path())
            .await
            .expect("Failed to create file backend");
        let backend = Arc::new(ScriptedBackend::wrap(inner));
        let vault = Vault::open(Arc::clone(&backend), VaultConfig::default())
            .await
            .expect("Failed to open file vault");
        Self {
            vault,
            backend,
            temp_dir: Some(temp_dir),
        }
    }
}

impl<B> TestVault<B> {
    /// Registers an encryption extension with a fixed credential and
    /// returns its key cache.
    pub fn encrypt_with(&self, password: &str, salt: &str) -> Arc<KeyCache> {
        let extension = EncryptionExtension::with_credential(
            Credential::new(password, salt),
            EncryptionConfig::new().kdf(TEST_KDF),
        );
        let cache = extension.key_cache();
        self.vault
            .register(extension)
            .expect("Failed to register encryption");
        cache
    }
}

impl<B> std::ops::Deref for TestVault<B> {
    type Target = Vault;

    fn deref(&self) -> &Self::Target {
        &self.vault
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a vault holding `count` keys `key_0..key_{count-1}` whose
    /// values are their index.
    pub async fn populated_vault(count: usize) -> TestVault {
        let test_vault = TestVault::memory().await;
        for i in 0..count {
            test_vault
                .set(format!("key_{i}"), i)
                .await
                .expect("Failed to populate vault");
        }
        test_vault
    }
}
