//! Error types for cryptographic primitives

use thiserror::Error;

/// Errors from ratchet rotation.
///
/// A rotation error means the peer asked for a key the ratchet cannot (or
/// must not) produce. The session the ratchet belongs to should be treated
/// as broken for that message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatchetError {
    /// Target counter lies behind the current position; ratchets never rewind
    #[error("cannot turn ratchet backwards: at {current}, requested {target}")]
    CannotRewind {
        /// Current ratchet counter
        current: u64,
        /// Requested counter
        target: u64,
    },

    /// Target counter lies too far ahead of the current position
    #[error("too many turns: at {current}, requested {target} (max {max} steps)")]
    TooManyTurns {
        /// Current ratchet counter
        current: u64,
        /// Requested counter
        target: u64,
        /// Maximum number of steps allowed in one catch-up
        max: u64,
    },

    /// Ratchet counter would overflow
    #[error("ratchet counter overflow at {current}")]
    CounterOverflow {
        /// Counter when the overflow was detected
        current: u64,
    },
}

/// Errors from key agreement and authenticated encryption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication tag did not verify (tampering or wrong key)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// DH output was all zeros: the public key is a low-order point
    #[error("non-contributory public key")]
    WeakPublicKey,

    /// Key material had the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_error_display() {
        let err = RatchetError::CannotRewind { current: 10, target: 3 };
        assert_eq!(err.to_string(), "cannot turn ratchet backwards: at 10, requested 3");
    }

    #[test]
    fn crypto_error_display_has_no_key_material() {
        let err = CryptoError::InvalidKeyLength { expected: 32, actual: 31 };
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 31");
    }
}
