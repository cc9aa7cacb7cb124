//! PBKDF2 key derivation and the bounded derivation cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use veilchain_core::constants::KDF_CACHE_CAPACITY;

use crate::hash::sha256_bytes;

/// Derive a key of `length` bytes with PBKDF2-HMAC-SHA256.
pub fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; length]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    // Digest, not the password itself: the cache key table must not hold
    // recoverable password material.
    password_digest: [u8; 32],
    salt: Vec<u8>,
    iterations: u32,
    length: usize,
}

/// Bounded LRU cache over PBKDF2 derivations.
///
/// Derivation at 100k iterations is deliberately slow; repeated operations
/// under the same password (index updates, multi-block decryption) go
/// through this cache. Explicit-handle service: construct once at host
/// startup and inject where needed.
pub struct KdfCache {
    inner: Mutex<LruCache<CacheKey, Zeroizing<Vec<u8>>>>,
}

impl Default for KdfCache {
    fn default() -> Self {
        Self::with_capacity(KDF_CACHE_CAPACITY)
    }
}

impl KdfCache {
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Derive through the cache. The returned buffer is the caller's copy;
    /// it zeroizes on drop.
    pub fn derive(
        &self,
        password: &str,
        salt: &[u8],
        iterations: u32,
        length: usize,
    ) -> Zeroizing<Vec<u8>> {
        let key = CacheKey {
            password_digest: sha256_bytes(password.as_bytes()),
            salt: salt.to_vec(),
            iterations,
            length,
        };

        let mut cache = self.inner.lock().expect("kdf cache poisoned");
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        drop(cache);

        let derived = derive_key(password, salt, iterations, length);
        let mut cache = self.inner.lock().expect("kdf cache poisoned");
        cache.put(key, derived.clone());
        derived
    }

    /// Drop every cached derivation (e.g. after a checkpoint restore).
    pub fn clear(&self) {
        self.inner.lock().expect("kdf cache poisoned").clear();
    }
}
