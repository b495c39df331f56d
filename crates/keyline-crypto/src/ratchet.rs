//! One-directional KDF ratchet for forward-secure key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: the chain key is overwritten on every turn
//! - Key Separation: chain keys and encryption keys use distinct labels
//! - Determinism: same initial chain key always produces the same sequence

use std::fmt;

use zeroize::Zeroize;

use crate::{
    error::RatchetError,
    kdf::{KEY_SIZE, derive_key},
};

/// Label for deriving the next chain key
const CHAIN_KEY_SALT: &[u8] = b"kdf-ck";

/// Label for deriving the encryption key at the current position
const ENCRYPTION_KEY_SALT: &[u8] = b"kdf-aek";

/// Maximum number of steps a single [`KdfRatchet::turn_until`] may perform.
///
/// Bounds the work a peer can force on us by announcing a huge counter.
pub const MAX_COUNTER_INCREMENT: u64 = 25_000;

/// A symmetric encryption key derived from a ratchet position.
///
/// Zeroized on drop. Used for exactly one message and then discarded.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// 32-byte key for XChaCha20-Poly1305.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Forward-secure hash-chain ratchet for one direction of a session.
///
/// Each [`turn()`](Self::turn):
/// 1. Derives the next chain key from the current one
/// 2. Overwrites the old chain key (forward secrecy)
/// 3. Increments the counter
///
/// The encryption key for the current position is derived on demand by
/// [`current_encryption_key()`](Self::current_encryption_key); the chain key
/// itself never leaves this type.
///
/// Not `Clone`: a second copy of the chain would outlive the forward-secrecy
/// window of the original.
pub struct KdfRatchet {
    /// Current chain key (32 bytes)
    chain_key: [u8; KEY_SIZE],
    /// Number of turns from the initial chain key, offset by the start value
    counter: u64,
}

impl KdfRatchet {
    /// Create a ratchet positioned at `initial_counter` with the given chain
    /// key.
    pub fn new(initial_counter: u64, initial_chain_key: [u8; KEY_SIZE]) -> Self {
        Self { chain_key: initial_chain_key, counter: initial_counter }
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Perform one ratchet step.
    ///
    /// The previous chain key is zeroized and cannot be recovered.
    pub fn turn(&mut self) -> Result<(), RatchetError> {
        let Some(next_counter) = self.counter.checked_add(1) else {
            return Err(RatchetError::CounterOverflow { current: self.counter });
        };

        let next_chain_key = derive_key(&self.chain_key, CHAIN_KEY_SALT);
        self.chain_key.zeroize();
        self.chain_key = next_chain_key;
        self.counter = next_counter;

        Ok(())
    }

    /// Turn the ratchet until its counter equals `target`.
    ///
    /// Returns the number of steps performed, so callers can detect skipped
    /// messages. Validation happens before any step, so on error the ratchet
    /// is unchanged.
    pub fn turn_until(&mut self, target: u64) -> Result<u64, RatchetError> {
        if target < self.counter {
            return Err(RatchetError::CannotRewind { current: self.counter, target });
        }

        let steps = target - self.counter;
        if steps > MAX_COUNTER_INCREMENT {
            return Err(RatchetError::TooManyTurns {
                current: self.counter,
                target,
                max: MAX_COUNTER_INCREMENT,
            });
        }

        while self.counter < target {
            self.turn()?;
        }

        debug_assert_eq!(self.counter, target);
        Ok(steps)
    }

    /// Encryption key at the current position. Does not advance.
    pub fn current_encryption_key(&self) -> EncryptionKey {
        EncryptionKey(derive_key(&self.chain_key, ENCRYPTION_KEY_SALT))
    }
}

impl fmt::Debug for KdfRatchet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KdfRatchet").field("counter", &self.counter).finish_non_exhaustive()
    }
}

impl Drop for KdfRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}
