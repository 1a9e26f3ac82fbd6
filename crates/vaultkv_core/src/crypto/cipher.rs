//! Credential-derived AES-256-GCM keys.

use crate::error::{VaultError, VaultResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// scrypt cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// log2 of the CPU/memory cost `N`.
    pub log_n: u8,
    /// Block size.
    pub r: u32,
    /// Parallelism.
    pub p: u32,
}

impl KdfParams {
    /// Creates a parameter set.
    #[must_use]
    pub const fn new(log_n: u8, r: u32, p: u32) -> Self {
        Self { log_n, r, p }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(15, 8, 1)
    }
}

/// A password and salt to derive a key from.
///
/// The password is zeroized on drop and never printed.
#[derive(Clone)]
pub struct Credential {
    password: Zeroizing<String>,
    salt: String,
}

impl Credential {
    /// Creates a credential.
    pub fn new(password: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
            salt: salt.into(),
        }
    }

    /// Returns the salt string.
    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// Returns a digest identifying this exact password and salt.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.password.len() as u64).to_le_bytes());
        hasher.update(self.password.as_bytes());
        hasher.update(self.salt.as_bytes());
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("password", &"[REDACTED]")
            .field("salt", &self.salt)
            .finish()
    }
}

/// A key derived from a [`Credential`].
///
/// The key can only seal and open. Its bytes are wiped as soon as the
/// cipher is keyed and cannot be read back.
pub struct DerivedKey {
    cipher: Aes256Gcm,
}

impl DerivedKey {
    /// Derives a key with scrypt.
    ///
    /// The salt string is hashed with SHA-256 first, so any string is valid
    /// salt material.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyDerivation`] if the parameters are rejected.
    pub fn derive(credential: &Credential, params: KdfParams) -> VaultResult<Self> {
        let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_SIZE)
            .map_err(|e| VaultError::key_derivation(format!("invalid scrypt parameters: {e}")))?;
        let salt = Sha256::digest(credential.salt.as_bytes());

        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        scrypt::scrypt(
            credential.password.as_bytes(),
            salt.as_slice(),
            &scrypt_params,
            bytes.as_mut_slice(),
        )
        .map_err(|e| VaultError::key_derivation(e.to_string()))?;

        let cipher = Aes256Gcm::new(GenericArray::from_slice(bytes.as_slice()));
        Ok(Self { cipher })
    }

    /// Derives a key on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyDerivation`] if derivation fails or the
    /// blocking task is lost.
    pub async fn derive_blocking(credential: Credential, params: KdfParams) -> VaultResult<Self> {
        tokio::task::spawn_blocking(move || Self::derive(&credential, params))
            .await
            .map_err(|e| VaultError::key_derivation(format!("derivation task failed: {e}")))?
    }

    /// Encrypts `plaintext`.
    ///
    /// The output format is: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
    pub fn seal(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::encryption_failed("encryption error"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    /// Decrypts bytes produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DecryptionFailed`] for a wrong key or corrupted
    /// input.
    pub fn open(&self, sealed: &[u8]) -> VaultResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::decryption_failed("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| VaultError::decryption_failed("wrong key or corrupted ciphertext"))
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
