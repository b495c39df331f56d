//! Error types for the keyline session layer.
//!
//! One enum per layer: identities, nonce tracking, DH sessions, message
//! coding and the processor that ties them together. Errors carry
//! identifiers (identity, session id, message id) for diagnosis but never
//! key material or nonces.

use keyline_crypto::{CryptoError, RatchetError};
use thiserror::Error;

use crate::{
    identity::{Identity, MessageId},
    session::{DhType, SessionId, VersionRange},
};

/// Invalid identity string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Identity is not exactly eight characters long
    #[error("identity must be 8 characters, got {actual}")]
    InvalidLength {
        /// Length of the rejected input
        actual: usize,
    },

    /// Identity contains a character outside `A-Z`, `0-9` and `*`
    #[error("invalid identity character at position {position}")]
    InvalidCharacter {
        /// Byte offset of the first invalid character
        position: usize,
    },
}

/// The contact directory has no public key for an identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no public key for identity {identity}")]
pub struct MissingPublicKey {
    /// Identity that could not be resolved
    pub identity: Identity,
}

/// A message body does not match the layout of its type.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed body: {reason}")]
pub struct MalformedBody {
    /// What was wrong with the body
    pub reason: &'static str,
}

/// Errors from nonce generation and tracking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    /// Every freshly generated nonce already existed in the store
    #[error("no unused nonce after {attempts} attempts")]
    Exhausted {
        /// Number of candidates tried
        attempts: usize,
    },

    /// Backing store failed
    #[error("nonce store error: {reason}")]
    Store {
        /// Store-specific description
        reason: String,
    },
}

/// Errors that invalidate a DH session.
///
/// Every variant means the session can no longer be trusted for the message
/// at hand; see [`SessionError::discards_session`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Ephemeral private key is gone (already accepted, or we responded)
    #[error("session {session_id}: ephemeral private key already discarded")]
    MissingEphemeralPrivateKey {
        /// Affected session
        session_id: SessionId,
    },

    /// Ratchet could not reach the requested counter
    #[error("session {session_id}: {source}")]
    Ratchet {
        /// Affected session
        session_id: SessionId,
        /// Underlying rotation error
        #[source]
        source: RatchetError,
    },

    /// The session has no ratchet for the requested DH type and direction
    #[error("session {session_id}: no {dh_type} ratchet available")]
    MissingRatchet {
        /// Affected session
        session_id: SessionId,
        /// Requested DH type
        dh_type: DhType,
    },

    /// Handshake payload could not be parsed
    #[error("malformed handshake: {reason}")]
    MalformedHandshake {
        /// What was wrong with the payload
        reason: &'static str,
    },

    /// Version ranges do not overlap
    #[error("unsupported version: local {local}, remote {remote}")]
    UnsupportedVersion {
        /// Versions this side supports
        local: VersionRange,
        /// Versions the peer offered
        remote: VersionRange,
    },

    /// Key agreement with the peer failed
    #[error("session {session_id}: key agreement failed: {source}")]
    KeyAgreement {
        /// Affected session
        session_id: SessionId,
        /// Underlying crypto error
        #[source]
        source: CryptoError,
    },
}

impl SessionError {
    /// Returns true if an existing session must be discarded.
    ///
    /// Handshake parsing and version negotiation fail before a session is
    /// created, so there is nothing to discard for them.
    pub fn discards_session(&self) -> bool {
        !matches!(self, Self::MalformedHandshake { .. } | Self::UnsupportedVersion { .. })
    }
}

/// Errors from encoding or decoding message boxes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoderError {
    /// Sender or recipient public key unknown
    #[error(transparent)]
    MissingPublicKey(#[from] MissingPublicKey),

    /// Box failed authentication, parsing or consistency checks
    #[error("bad message {message_id}: {reason}")]
    BadMessage {
        /// Message id from the box header
        message_id: MessageId,
        /// What failed
        reason: &'static str,
    },

    /// The nonce reserved for this message was already used
    #[error("nonce reuse detected for message {message_id}")]
    NonceReused {
        /// Message that would have reused the nonce
        message_id: MessageId,
    },

    /// Nonce store failed
    #[error(transparent)]
    Nonce(#[from] NonceError),

    /// Long-term key agreement failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl CoderError {
    /// Returns true if retrying the same operation can never succeed.
    ///
    /// A reused nonce is fatal for the sender: the message must be rebuilt
    /// with a fresh nonce, never resent as is.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BadMessage { .. } | Self::NonceReused { .. } | Self::Crypto(_)
        )
    }
}

/// Errors surfaced by the forward-security processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Session layer failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Encoding or decoding failure
    #[error(transparent)]
    Coder(#[from] CoderError),

    /// Nonce tracking failure
    #[error(transparent)]
    Nonce(#[from] NonceError),

    /// Peer has no public key
    #[error(transparent)]
    MissingPublicKey(#[from] MissingPublicKey),

    /// Incoming box reused a nonce we have already seen
    #[error("replayed message {message_id} from {sender}")]
    Replay {
        /// Message id from the box header
        message_id: MessageId,
        /// Claimed sender
        sender: Identity,
    },

    /// Message kind cannot be sent through a forward-secure session
    #[error("message {message_id} cannot be sent through a session")]
    NotSessionEligible {
        /// Rejected message
        message_id: MessageId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_id() -> SessionId {
        SessionId::from_bytes([0xab; 16])
    }

    #[test]
    fn rewind_discards_session() {
        let err = SessionError::Ratchet {
            session_id: session_id(),
            source: RatchetError::CannotRewind { current: 5, target: 2 },
        };
        assert!(err.discards_session());
    }

    #[test]
    fn handshake_errors_have_no_session_to_discard() {
        let err = SessionError::MalformedHandshake { reason: "too short" };
        assert!(!err.discards_session());
    }

    #[test]
    fn too_many_turns_discards_session() {
        let err = SessionError::Ratchet {
            session_id: session_id(),
            source: RatchetError::TooManyTurns { current: 1, target: 100_000, max: 25_000 },
        };
        assert!(err.discards_session());
    }

    #[test]
    fn missing_key_discards_session() {
        let err = SessionError::MissingEphemeralPrivateKey { session_id: session_id() };
        assert!(err.discards_session());
        assert_eq!(
            err.to_string(),
            "session abababababababababababababababab: ephemeral private key already discarded"
        );
    }

    #[test]
    fn nonce_reuse_is_fatal() {
        let err = CoderError::NonceReused { message_id: MessageId::new(1) };
        assert!(err.is_fatal());

        let err = CoderError::Nonce(NonceError::Store { reason: "disk full".into() });
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_public_key_names_identity() {
        let identity = Identity::new("ECHOECHO").unwrap();
        let err = MissingPublicKey { identity };
        assert_eq!(err.to_string(), "no public key for identity ECHOECHO");
    }
}
