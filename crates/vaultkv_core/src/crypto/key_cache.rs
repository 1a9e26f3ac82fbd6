//! Cache of derived keys keyed by credential identity.

use super::cipher::{Credential, DerivedKey, KdfParams};
use crate::error::VaultResult;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

/// Which credential a cached key was derived for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialIdentity {
    /// The single credential shared by every key.
    Fixed,
    /// The credential a provider returned for one data key.
    DataKey(String),
}

/// Counters describing cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCacheStats {
    /// Number of key derivations performed.
    pub derivations: u64,
    /// Number of lookups served from the cache.
    pub hits: u64,
    /// Number of entries dropped because the credential changed.
    pub rotations: u64,
    /// Number of entries currently cached.
    pub entries: usize,
}

/// Public view of one cache entry.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntryInfo {
    /// When the key was derived.
    pub cached_at: Instant,
    /// Number of cache hits on this entry.
    pub access_count: u64,
}

struct CacheEntry {
    key: Arc<DerivedKey>,
    fingerprint: [u8; 32],
    cached_at: Instant,
    access_count: u64,
}

/// Bounded LRU cache of derived keys.
///
/// An entry is reused only for the exact credential it was derived from.
/// When a lookup presents a different credential for a cached identity the
/// entry is dropped and the key derived again.
///
/// Lookups are serialized: the cache lock is held across a derivation, so
/// concurrent first uses of an identity derive once.
///
/// A cache with capacity 0 stores nothing and derives on every lookup.
pub struct KeyCache {
    params: KdfParams,
    capacity: usize,
    entries: Mutex<LruCache<CredentialIdentity, CacheEntry>>,
    derivations: AtomicU64,
    hits: AtomicU64,
    rotations: AtomicU64,
}

impl KeyCache {
    /// Creates a cache holding at most `capacity` keys.
    pub fn new(capacity: usize, params: KdfParams) -> Self {
        let size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            params,
            capacity,
            entries: Mutex::new(LruCache::new(size)),
            derivations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    /// Returns the maximum number of cached keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the key for `identity`, deriving it from `credential` unless
    /// a key derived from the same credential is cached.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyDerivation`](crate::VaultError::KeyDerivation)
    /// if derivation fails. Nothing is cached in that case.
    pub async fn get_or_derive(
        &self,
        identity: CredentialIdentity,
        credential: Credential,
    ) -> VaultResult<Arc<DerivedKey>> {
        if self.capacity == 0 {
            return self.derive(credential).await;
        }

        let fingerprint = credential.fingerprint();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&identity) {
            if entry.fingerprint == fingerprint {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.key));
            }
            entries.pop(&identity);
            self.rotations.fetch_add(1, Ordering::Relaxed);
            debug!(identity = ?identity, "credential changed; re-deriving key");
        }

        let key = self.derive(credential).await?;
        entries.put(
            identity,
            CacheEntry {
                key: Arc::clone(&key),
                fingerprint,
                cached_at: Instant::now(),
                access_count: 0,
            },
        );
        Ok(key)
    }

    /// Drops the entry for `identity`. Returns true if one was cached.
    pub async fn invalidate(&self, identity: &CredentialIdentity) -> bool {
        self.entries.lock().await.pop(identity).is_some()
    }

    /// Drops every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Returns details of the entry for `identity` without touching its
    /// recency.
    pub async fn entry(&self, identity: &CredentialIdentity) -> Option<CacheEntryInfo> {
        self.entries.lock().await.peek(identity).map(|entry| CacheEntryInfo {
            cached_at: entry.cached_at,
            access_count: entry.access_count,
        })
    }

    /// Returns current counters.
    pub async fn stats(&self) -> KeyCacheStats {
        KeyCacheStats {
            derivations: self.derivations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }

    async fn derive(&self, credential: Credential) -> VaultResult<Arc<DerivedKey>> {
        let key = DerivedKey::derive_blocking(credential, self.params).await?;
        self.derivations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(key))
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("params", &self.params)
            .field("capacity", &self.capacity)
            .field("derivations", &self.derivations.load(Ordering::Relaxed))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const FAST: KdfParams = KdfParams::new(4, 8, 1);

    fn data_key(key: &str) -> CredentialIdentity {
        CredentialIdentity::DataKey(key.to_owned())
    }

    #[tokio::test]
    async fn fixed_credential_derives_once() {
        let cache = KeyCache::new(1, FAST);
        let credential = Credential::new("p", "s");

        let first = cache
            .get_or_derive(CredentialIdentity::Fixed, credential.clone())
            .await
            .unwrap();
        let sealed = first.seal(b"hello").unwrap();
        let second = cache
            .get_or_derive(CredentialIdentity::Fixed, credential)
            .await
            .unwrap();

        assert_eq!(second.open(&sealed).unwrap(), b"hello");
        let stats = cache.stats().await;
        assert_eq!(stats.derivations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);

        let info = cache.entry(&CredentialIdentity::Fixed).await.unwrap();
        assert_eq!(info.access_count, 1);
    }

    #[tokio::test]
    async fn changed_credential_is_never_reused() {
        let cache = KeyCache::new(4, FAST);
        let old = cache
            .get_or_derive(data_key("a"), Credential::new("old", "s"))
            .await
            .unwrap();
        let sealed = old.seal(b"x").unwrap();

        let new = cache
            .get_or_derive(data_key("a"), Credential::new("new", "s"))
            .await
            .unwrap();

        assert!(new.open(&sealed).is_err());
        let stats = cache.stats().await;
        assert_eq!(stats.derivations, 2);
        assert_eq!(stats.rotations, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn capacity_bounds_entries() {
        let cache = KeyCache::new(2, FAST);
        for key in ["a", "b", "c"] {
            cache
                .get_or_derive(data_key(key), Credential::new("p", key))
                .await
                .unwrap();
        }

        assert_eq!(cache.stats().await.entries, 2);
        assert!(cache.entry(&data_key("a")).await.is_none());
        assert!(cache.entry(&data_key("c")).await.is_some());
    }

    #[tokio::test]
    async fn zero_capacity_never_caches() {
        let cache = KeyCache::new(0, FAST);
        for _ in 0..2 {
            cache
                .get_or_derive(data_key("a"), Credential::new("p", "s"))
                .await
                .unwrap();
        }

        let stats = cache.stats().await;
        assert_eq!(stats.derivations, 2);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let cache = KeyCache::new(4, FAST);
        cache
            .get_or_derive(data_key("a"), Credential::new("p", "s"))
            .await
            .unwrap();
        cache
            .get_or_derive(data_key("b"), Credential::new("p", "s"))
            .await
            .unwrap();

        assert!(cache.invalidate(&data_key("a")).await);
        assert!(!cache.invalidate(&data_key("a")).await);
        assert_eq!(cache.stats().await.entries, 1);

        cache.clear().await;
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn failed_derivation_is_not_cached() {
        let cache = KeyCache::new(1, KdfParams::new(4, 0, 1));
        let err = cache
            .get_or_derive(CredentialIdentity::Fixed, Credential::new("p", "s"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CryptoDerivation);
        assert_eq!(cache.stats().await, KeyCacheStats::default());
    }

    #[tokio::test]
    async fn concurrent_first_use_derives_once() {
        let cache = Arc::new(KeyCache::new(1, FAST));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .get_or_derive(CredentialIdentity::Fixed, Credential::new("p", "s"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = cache.stats().await;
        assert_eq!(stats.derivations, 1);
        assert_eq!(stats.hits, 7);
    }
}
