//! Keyline Core
//!
//! Forward-secrecy session layer for a store-and-forward messenger. Two
//! identities with long-term X25519 keys establish DH sessions, derive one
//! key per message from KDF ratchets, and exchange encrypted boxes through
//! an untrusted relay.
//!
//! # Architecture
//!
//! Sans-IO and action-based: the [`ForwardSecurityProcessor`] takes
//! messages and boxes, and returns [`FsAction`]s for the caller to execute
//! (send a box, deliver a message, report an event). Stores and the
//! randomness source are injected, so the whole layer runs deterministically
//! under [`SeededEnv`].
//!
//! # Components
//!
//! - [`DhSession`]: 2-DH / 4-DH key agreement and per-direction ratchets
//! - [`NonceFactory`]: unique nonces with replay tracking
//! - [`MessageCoder`]: plaintext messages to authenticated boxes and back
//! - [`MessageQueue`]: outgoing boxes awaiting server acknowledgement
//! - [`ForwardSecurityProcessor`]: ties the above together

#![forbid(unsafe_code)]

pub mod coder;
pub mod config;
pub mod contacts;
pub mod env;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod nonce;
pub mod processor;
pub mod queue;
pub mod session;
pub mod transport;

pub use coder::{MessageBox, MessageCoder, SessionHeader};
pub use config::Config;
pub use contacts::{Contact, ContactDirectory, MemoryContactDirectory};
pub use env::{Environment, SeededEnv, SystemEnv};
pub use error::{
    CoderError, IdentityError, MalformedBody, MissingPublicKey, NonceError, ProcessorError,
    SessionError,
};
pub use event::{FsAction, FsEvent};
pub use identity::{Identity, IdentityStore, LocalIdentity, MessageId};
pub use message::{
    FsControl, Location, Message, MessageBody, MessageFlags, ReceiptType, RejectCause, TerminateCause,
};
pub use nonce::{MemoryNonceStore, NonceFactory, NonceStore};
pub use processor::ForwardSecurityProcessor;
pub use queue::{MessageQueue, QueueMessageId, QueuedMessage, SnapshotError};
pub use session::{
    DhSession, DhSessionStore, DhType, HandshakePayload, MemorySessionStore, SessionId,
    SessionKey, SessionState, SharedSession, VersionRange,
};
pub use transport::Transport;
