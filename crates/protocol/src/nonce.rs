//! Nonce derivation from the handshake's shared secret.
//!
//! The nonce is a SHA-256 digest of the shared secret folded down to 12 bytes:
//!
//! ```text
//! nonce[i] = h[i] + h[i + 12] + h[i + 24]   (i < 8, mod 256)
//! nonce[i] = h[i] + h[i + 12]               (8 <= i < 12, mod 256)
//! ```
//!
//! This is not a key derivation function. It exists so that both ends of the
//! connection arrive at the same ChaCha20 nonce without another round-trip, and
//! it must stay bit-compatible with the nodes. New protocols should use HKDF.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Length of a derived nonce in bytes.
pub const NONCE_LENGTH: usize = 12;

/// Number of secrets remembered by the process-wide deriver.
pub const DEFAULT_NONCE_CACHE_CAPACITY: usize = 1024;

/// A 96-bit ChaCha20 nonce.
pub type Nonce = [u8; NONCE_LENGTH];

/// Derives the nonce for a shared secret. Pure and deterministic.
pub fn derive_nonce(shared_secret: &[u8]) -> Nonce {
    let digest = Sha256::digest(shared_secret);
    let mut nonce = [0u8; NONCE_LENGTH];

    for (i, byte) in nonce.iter_mut().enumerate() {
        *byte = digest[i].wrapping_add(digest[i + NONCE_LENGTH]);
        // The third window is only 8 bytes long (32 - 24).
        if i + 2 * NONCE_LENGTH < digest.len() {
            *byte = byte.wrapping_add(digest[i + 2 * NONCE_LENGTH]);
        }
    }

    nonce
}

/// Memoizing nonce deriver with least-recently-used eviction.
pub struct NonceDeriver {
    cache: Mutex<LruCache<Vec<u8>, Nonce>>,
}

impl NonceDeriver {
    /// Creates a deriver that remembers up to `capacity` secrets.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The process-wide deriver used by the handshake.
    pub fn global() -> &'static NonceDeriver {
        static GLOBAL: OnceLock<NonceDeriver> = OnceLock::new();
        GLOBAL.get_or_init(NonceDeriver::default)
    }

    /// Returns the nonce for `shared_secret`, computing it on first use.
    pub fn derive(&self, shared_secret: &[u8]) -> Nonce {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(nonce) = cache.get(shared_secret) {
            return *nonce;
        }

        let nonce = derive_nonce(shared_secret);
        cache.put(shared_secret.to_vec(), nonce);
        nonce
    }

    /// Number of secrets currently memoized.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceDeriver {
    fn default() -> Self {
        let capacity =
            NonZeroUsize::new(DEFAULT_NONCE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self::with_capacity(capacity)
    }
}

impl std::fmt::Debug for NonceDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceDeriver")
            .field("cached", &self.len())
            .finish()
    }
}
