//! Extension that encrypts stored values.

use super::cipher::{Credential, DerivedKey, KdfParams};
use super::key_cache::{CredentialIdentity, KeyCache};
use crate::context::{OpResult, OperationContext};
use crate::error::{VaultError, VaultResult};
use crate::pipeline::Extension;
use crate::types::Operation;
use crate::vault::Vault;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::sync::Arc;

/// Field marking a stored value as an encryption envelope.
pub const ENVELOPE_TAG: &str = "$vaultkv_enc";
/// Current envelope format.
pub const ENVELOPE_VERSION: u64 = 1;
/// Helper name under which the extension attaches its [`KeyCache`].
pub const KEY_CACHE_HELPER: &str = "encryption.key_cache";

/// Configuration for [`EncryptionExtension`].
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Key derivation cost.
    pub kdf: KdfParams,
    /// Number of provider-supplied keys to cache. 0 disables caching.
    pub per_key_cache_capacity: usize,
}

impl EncryptionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key derivation parameters.
    #[must_use]
    pub const fn kdf(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }

    /// Sets how many provider-supplied keys are cached.
    #[must_use]
    pub const fn per_key_cache_capacity(mut self, capacity: usize) -> Self {
        self.per_key_cache_capacity = capacity;
        self
    }
}

/// Supplies the credential for a data key.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Returns the credential protecting `key`.
    async fn credential(&self, key: &str) -> VaultResult<Credential>;
}

/// A [`CredentialProvider`] backed by a closure. See [`provider_fn`].
pub struct FnProvider<F>(F);

/// Wraps a closure as a [`CredentialProvider`].
pub fn provider_fn<F>(f: F) -> FnProvider<F>
where
    F: Fn(&str) -> VaultResult<Credential> + Send + Sync + 'static,
{
    FnProvider(f)
}

#[async_trait]
impl<F> CredentialProvider for FnProvider<F>
where
    F: Fn(&str) -> VaultResult<Credential> + Send + Sync + 'static,
{
    async fn credential(&self, key: &str) -> VaultResult<Credential> {
        (self.0)(key)
    }
}

enum CredentialSource {
    Fixed(Credential),
    Provider(Arc<dyn CredentialProvider>),
}

/// Seals values on `set` and opens them on `get`.
///
/// Values are stored as `{"$vaultkv_enc": 1, "data": "<base64>"}` where
/// `data` is the AES-256-GCM sealed JSON encoding of the value. Metadata is
/// stored in the clear. Reads of values that are not envelopes are returned
/// unchanged, so a store may hold plaintext written before the extension
/// was registered.
///
/// ```rust
/// use vaultkv_core::crypto::{Credential, EncryptionConfig, EncryptionExtension};
/// use vaultkv_core::Vault;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let vault = Vault::open_in_memory().await.unwrap();
/// let credential = Credential::new("correct horse", "vault-salt");
/// vault
///     .register(EncryptionExtension::with_credential(credential, EncryptionConfig::new()))
///     .unwrap();
///
/// vault.set("token", "s3cret").await.unwrap();
/// assert_eq!(vault.get("token").await.unwrap(), Some("s3cret".into()));
/// # });
/// ```
pub struct EncryptionExtension {
    source: CredentialSource,
    cache: Arc<KeyCache>,
}

impl EncryptionExtension {
    /// Encrypts every key with one credential. The derived key is cached.
    pub fn with_credential(credential: Credential, config: EncryptionConfig) -> Self {
        Self {
            source: CredentialSource::Fixed(credential),
            cache: Arc::new(KeyCache::new(1, config.kdf)),
        }
    }

    /// Asks `provider` for the credential of each key.
    ///
    /// Derived keys are cached only if
    /// [`EncryptionConfig::per_key_cache_capacity`] is non-zero.
    pub fn with_provider(provider: impl CredentialProvider, config: EncryptionConfig) -> Self {
        Self {
            source: CredentialSource::Provider(Arc::new(provider)),
            cache: Arc::new(KeyCache::new(config.per_key_cache_capacity, config.kdf)),
        }
    }

    /// Returns the key cache.
    pub fn key_cache(&self) -> Arc<KeyCache> {
        Arc::clone(&self.cache)
    }

    async fn key_for(&self, data_key: &str) -> VaultResult<Arc<DerivedKey>> {
        match &self.source {
            CredentialSource::Fixed(credential) => {
                self.cache
                    .get_or_derive(CredentialIdentity::Fixed, credential.clone())
                    .await
            }
            CredentialSource::Provider(provider) => {
                let credential = provider.credential(data_key).await?;
                self.cache
                    .get_or_derive(CredentialIdentity::DataKey(data_key.to_owned()), credential)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for EncryptionExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            CredentialSource::Fixed(_) => "fixed",
            CredentialSource::Provider(_) => "provider",
        };
        f.debug_struct("EncryptionExtension")
            .field("source", &source)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Returns the sealed bytes if `value` is an envelope.
fn envelope_data(value: &Value) -> VaultResult<Option<Vec<u8>>> {
    let Some(version) = value.get(ENVELOPE_TAG) else {
        return Ok(None);
    };
    if version.as_u64() != Some(ENVELOPE_VERSION) {
        return Err(VaultError::decryption_failed(format!(
            "unsupported envelope version {version}"
        )));
    }
    let data = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| VaultError::decryption_failed("envelope has no data"))?;
    STANDARD
        .decode(data)
        .map(Some)
        .map_err(|e| VaultError::decryption_failed(format!("envelope data is not base64: {e}")))
}

#[async_trait]
impl Extension for EncryptionExtension {
    fn name(&self) -> &str {
        "encryption"
    }

    fn on_register(&self, vault: &Vault) -> VaultResult<()> {
        vault.attach_helper(KEY_CACHE_HELPER, self.key_cache());
        Ok(())
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if ctx.operation != Operation::Set {
            return Ok(());
        }
        let (Some(key), Some(value)) = (ctx.key.as_deref(), ctx.value.as_ref()) else {
            return Ok(());
        };

        let plaintext = serde_json::to_vec(value)?;
        let sealed = self.key_for(key).await?.seal(&plaintext)?;
        ctx.value = Some(json!({
            ENVELOPE_TAG: ENVELOPE_VERSION,
            "data": STANDARD.encode(sealed),
        }));
        Ok(())
    }

    async fn after(&self, ctx: &OperationContext, result: OpResult) -> VaultResult<OpResult> {
        if ctx.operation != Operation::Get {
            return Ok(result);
        }
        let sealed = match &result {
            OpResult::Value(Some(stored)) => envelope_data(stored)?,
            _ => None,
        };
        let (Some(sealed), Some(key)) = (sealed, ctx.key.as_deref()) else {
            return Ok(result);
        };

        let plaintext = self.key_for(key).await?.open(&sealed)?;
        let value = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::decryption_failed(format!("opened value is not JSON: {e}")))?;
        Ok(OpResult::Value(Some(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::error::ErrorKind;
    use vaultkv_storage::InMemoryBackend;

    const FAST: KdfParams = KdfParams::new(4, 8, 1);

    fn config() -> EncryptionConfig {
        EncryptionConfig::new().kdf(FAST)
    }

    async fn vault_with_backend() -> (Vault, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let vault = Vault::open(Arc::clone(&backend), VaultConfig::default())
            .await
            .unwrap();
        (vault, backend)
    }

    #[tokio::test]
    async fn values_are_sealed_at_rest() {
        let (vault, backend) = vault_with_backend().await;
        vault
            .register(EncryptionExtension::with_credential(Credential::new("p", "s"), config()))
            .unwrap();

        vault.set_with_meta("k", json!({"n": 1}), json!({"kind": "pref"})).await.unwrap();

        let stored = backend.snapshot("vault");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value[ENVELOPE_TAG], json!(1));
        assert!(!stored[0].value.to_string().contains("\"n\""));
        assert_eq!(stored[0].meta, Some(json!({"kind": "pref"})));

        assert_eq!(vault.get("k").await.unwrap(), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn plaintext_values_pass_through() {
        let vault = Vault::open_in_memory().await.unwrap();
        vault.set("legacy", "plain").await.unwrap();
        vault
            .register(EncryptionExtension::with_credential(Credential::new("p", "s"), config()))
            .unwrap();

        assert_eq!(vault.get("legacy").await.unwrap(), Some(json!("plain")));
        assert_eq!(vault.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn key_cache_is_attached_as_helper() {
        let vault = Vault::open_in_memory().await.unwrap();
        let extension = EncryptionExtension::with_credential(Credential::new("p", "s"), config());
        let cache = extension.key_cache();
        vault.register(extension).unwrap();

        let helper = vault.helper::<KeyCache>(KEY_CACHE_HELPER).unwrap();
        assert!(Arc::ptr_eq(&helper, &cache));
        assert_eq!(helper.capacity(), 1);
    }

    #[tokio::test]
    async fn provider_keys_are_per_data_key() {
        let (vault, backend) = vault_with_backend().await;
        let provider = provider_fn(|key| Ok(Credential::new(format!("pw-{key}"), "s")));
        vault
            .register(EncryptionExtension::with_provider(provider, config().per_key_cache_capacity(8)))
            .unwrap();

        vault.set("a", "x").await.unwrap();
        vault.set("b", "x").await.unwrap();
        assert_eq!(vault.get("a").await.unwrap(), Some(json!("x")));

        let stored = backend.snapshot("vault");
        assert_ne!(stored[0].value, stored[1].value);

        let cache = vault.helper::<KeyCache>(KEY_CACHE_HELPER).unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.derivations, 2);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn provider_failure_vetoes_write() {
        let (vault, backend) = vault_with_backend().await;
        let provider = provider_fn(|key| {
            if key == "locked" {
                Err(VaultError::key_derivation("no credential for key"))
            } else {
                Ok(Credential::new("p", "s"))
            }
        });
        vault
            .register(EncryptionExtension::with_provider(provider, config()))
            .unwrap();

        let err = vault.set("locked", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoDerivation);
        assert!(backend.snapshot("vault").is_empty());
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_decryption_error() {
        let (vault, _backend) = vault_with_backend().await;
        vault
            .set("k", json!({ENVELOPE_TAG: 1, "data": "***"}))
            .await
            .unwrap();
        vault
            .set("v", json!({ENVELOPE_TAG: 9, "data": ""}))
            .await
            .unwrap();
        vault
            .register(EncryptionExtension::with_credential(Credential::new("p", "s"), config()))
            .unwrap();

        assert_eq!(vault.get("k").await.unwrap_err().kind(), ErrorKind::CryptoOpen);
        assert_eq!(vault.get("v").await.unwrap_err().kind(), ErrorKind::CryptoOpen);
    }
}
