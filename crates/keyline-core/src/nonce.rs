//! Nonce generation and reuse tracking.
//!
//! Every box carries a 24-byte random nonce. The [`NonceFactory`] guarantees
//! that a nonce handed out is not already recorded and records nonces on
//! request; stores only ever see `HMAC-SHA256(hash_key, nonce)`.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use keyline_crypto::{NONCE_HASH_SIZE, Nonce, hash_nonce};

use crate::{env::Environment, error::NonceError};

/// Candidates drawn before [`NonceFactory::next`] gives up.
///
/// A collision of 24 random bytes means the RNG is broken; retrying forever
/// would hide that.
pub const MAX_NONCE_ATTEMPTS: usize = 8;

/// Hashed nonce as persisted by a [`NonceStore`].
pub type NonceHash = [u8; NONCE_HASH_SIZE];

/// Persistent set of used nonce hashes.
pub trait NonceStore: Send + Sync {
    /// Whether `hash` has been recorded.
    fn exists(&self, hash: &NonceHash) -> Result<bool, NonceError>;

    /// Record `hash`. Returns true if it was not recorded before.
    fn store(&self, hash: &NonceHash) -> Result<bool, NonceError>;

    /// Forget `hash`. Returns true if it was recorded.
    fn remove(&self, hash: &NonceHash) -> Result<bool, NonceError>;
}

/// In-memory nonce store.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct MemoryNonceStore {
    hashes: Arc<Mutex<HashSet<NonceHash>>>,
}

impl MemoryNonceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nonces.
    pub fn len(&self) -> usize {
        self.hashes.lock().expect("MemoryNonceStore mutex poisoned").len()
    }

    /// Whether no nonce has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonceStore for MemoryNonceStore {
    fn exists(&self, hash: &NonceHash) -> Result<bool, NonceError> {
        Ok(self.hashes.lock().expect("MemoryNonceStore mutex poisoned").contains(hash))
    }

    fn store(&self, hash: &NonceHash) -> Result<bool, NonceError> {
        Ok(self.hashes.lock().expect("MemoryNonceStore mutex poisoned").insert(*hash))
    }

    fn remove(&self, hash: &NonceHash) -> Result<bool, NonceError> {
        Ok(self.hashes.lock().expect("MemoryNonceStore mutex poisoned").remove(hash))
    }
}

/// Generates fresh nonces and tracks used ones.
///
/// # Invariants
///
/// - All operations run under one internal lock, so check-then-store is
///   atomic with respect to other callers of the same factory
/// - A nonce returned by [`next`](Self::next) was not recorded at the time
///   it was returned
pub struct NonceFactory<S, E> {
    store: S,
    env: E,
    hash_key: Vec<u8>,
    lock: Mutex<()>,
}

impl<S: NonceStore, E: Environment> NonceFactory<S, E> {
    /// Create a factory hashing nonces with `hash_key` (the local identity).
    pub fn new(hash_key: &[u8], store: S, env: E) -> Self {
        Self { store, env, hash_key: hash_key.to_vec(), lock: Mutex::new(()) }
    }

    /// Draw a nonce that is not yet recorded.
    ///
    /// With `save`, the nonce is recorded before returning. Without, the
    /// caller records it later through [`store`](Self::store) (the coder
    /// does so when it commits the encoded message).
    ///
    /// # Errors
    ///
    /// - `Exhausted`: every candidate collided ([`MAX_NONCE_ATTEMPTS`])
    /// - `Store`: the backing store failed
    pub fn next(&self, save: bool) -> Result<Nonce, NonceError> {
        let _guard = self.lock.lock().expect("NonceFactory mutex poisoned");

        for attempt in 1..=MAX_NONCE_ATTEMPTS {
            let nonce = Nonce::from_bytes(self.env.random_array());
            let hash = self.hash(&nonce);

            if self.store.exists(&hash)? {
                tracing::warn!(attempt, "nonce collision, drawing again");
                continue;
            }
            if save && !self.store.store(&hash)? {
                tracing::warn!(attempt, "nonce recorded concurrently, drawing again");
                continue;
            }
            return Ok(nonce);
        }

        Err(NonceError::Exhausted { attempts: MAX_NONCE_ATTEMPTS })
    }

    /// Record `nonce`. Returns false if it was already recorded.
    ///
    /// `false` means reuse: the caller must not send (or accept) the message.
    pub fn store(&self, nonce: &Nonce) -> Result<bool, NonceError> {
        let _guard = self.lock.lock().expect("NonceFactory mutex poisoned");
        self.store.store(&self.hash(nonce))
    }

    /// Forget a nonce recorded by [`store`](Self::store) for a message that
    /// was never handled, so a later copy is not mistaken for a replay.
    pub fn release(&self, nonce: &Nonce) -> Result<bool, NonceError> {
        let _guard = self.lock.lock().expect("NonceFactory mutex poisoned");
        self.store.remove(&self.hash(nonce))
    }

    /// Whether `nonce` has been recorded.
    pub fn exists(&self, nonce: &Nonce) -> Result<bool, NonceError> {
        let _guard = self.lock.lock().expect("NonceFactory mutex poisoned");
        self.store.exists(&self.hash(nonce))
    }

    /// Underlying store.
    pub fn nonce_store(&self) -> &S {
        &self.store
    }

    fn hash(&self, nonce: &Nonce) -> NonceHash {
        hash_nonce(&self.hash_key, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SeededEnv;

    /// Environment that always yields the same bytes.
    #[derive(Clone)]
    struct StuckEnv;

    impl Environment for StuckEnv {
        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x5a);
        }

        fn wall_clock_millis(&self) -> u64 {
            0
        }
    }

    /// Store whose backend always fails.
    struct BrokenStore;

    impl NonceStore for BrokenStore {
        fn exists(&self, _hash: &NonceHash) -> Result<bool, NonceError> {
            Err(NonceError::Store { reason: "offline".into() })
        }

        fn store(&self, _hash: &NonceHash) -> Result<bool, NonceError> {
            Err(NonceError::Store { reason: "offline".into() })
        }

        fn remove(&self, _hash: &NonceHash) -> Result<bool, NonceError> {
            Err(NonceError::Store { reason: "offline".into() })
        }
    }

    fn factory() -> NonceFactory<MemoryNonceStore, SeededEnv> {
        NonceFactory::new(b"ALICE001", MemoryNonceStore::new(), SeededEnv::new(1))
    }

    #[test]
    fn next_with_save_records_nonce() {
        let factory = factory();
        let nonce = factory.next(true).unwrap();

        assert!(factory.exists(&nonce).unwrap());
        assert!(!factory.store(&nonce).unwrap());
        assert_eq!(factory.nonce_store().len(), 1);
    }

    #[test]
    fn next_without_save_leaves_store_untouched() {
        let factory = factory();
        let nonce = factory.next(false).unwrap();

        assert!(!factory.exists(&nonce).unwrap());
        assert!(factory.nonce_store().is_empty());
        assert!(factory.store(&nonce).unwrap());
    }

    #[test]
    fn store_reports_reuse() {
        let factory = factory();
        let nonce = Nonce::from_bytes([3u8; 24]);

        assert!(factory.store(&nonce).unwrap());
        assert!(!factory.store(&nonce).unwrap());
    }

    #[test]
    fn release_forgets_recorded_nonce() {
        let factory = factory();
        let nonce = Nonce::from_bytes([4u8; 24]);

        assert!(!factory.release(&nonce).unwrap());
        assert!(factory.store(&nonce).unwrap());
        assert!(factory.release(&nonce).unwrap());
        assert!(!factory.exists(&nonce).unwrap());
        assert!(factory.store(&nonce).unwrap());
    }

    #[test]
    fn store_keeps_hashes_not_nonces() {
        let store = MemoryNonceStore::new();
        let factory = NonceFactory::new(b"ALICE001", store.clone(), SeededEnv::new(1));
        let nonce = Nonce::from_bytes([7u8; 24]);
        factory.store(&nonce).unwrap();

        let mut raw = [0u8; 32];
        raw[..24].copy_from_slice(nonce.as_bytes());
        assert!(!store.exists(&raw).unwrap());
        assert!(store.exists(&hash_nonce(b"ALICE001", &nonce)).unwrap());
    }

    #[test]
    fn broken_rng_surfaces_as_exhaustion() {
        let factory = NonceFactory::new(b"ALICE001", MemoryNonceStore::new(), StuckEnv);

        factory.next(true).unwrap();
        assert_eq!(
            factory.next(true),
            Err(NonceError::Exhausted { attempts: MAX_NONCE_ATTEMPTS })
        );
    }

    #[test]
    fn store_failures_propagate() {
        let factory = NonceFactory::new(b"ALICE001", BrokenStore, SeededEnv::new(1));
        assert!(matches!(factory.next(true), Err(NonceError::Store { .. })));
        assert!(matches!(factory.exists(&Nonce::from_bytes([0; 24])), Err(NonceError::Store { .. })));
    }
}
