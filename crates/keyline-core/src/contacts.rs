//! Contact directory: identity to long-term public key.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use keyline_crypto::PublicKey;

use crate::{error::MissingPublicKey, identity::Identity};

/// A peer with a known long-term public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    /// Peer identity
    pub identity: Identity,
    /// Peer long-term public key
    pub public_key: PublicKey,
}

/// Resolves identities to long-term public keys.
pub trait ContactDirectory: Send + Sync {
    /// Public key of `identity`.
    fn resolve_public_key(&self, identity: &Identity) -> Result<PublicKey, MissingPublicKey>;

    /// Resolve `identity` into a [`Contact`].
    fn contact(&self, identity: &Identity) -> Result<Contact, MissingPublicKey> {
        Ok(Contact { identity: *identity, public_key: self.resolve_public_key(identity)? })
    }
}

/// In-memory contact directory.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryContactDirectory {
    contacts: Arc<Mutex<HashMap<Identity, PublicKey>>>,
}

impl MemoryContactDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a contact.
    pub fn add(&self, contact: Contact) {
        self.contacts
            .lock()
            .expect("MemoryContactDirectory mutex poisoned")
            .insert(contact.identity, contact.public_key);
    }

    /// Remove a contact. Returns true if it was present.
    pub fn remove(&self, identity: &Identity) -> bool {
        self.contacts
            .lock()
            .expect("MemoryContactDirectory mutex poisoned")
            .remove(identity)
            .is_some()
    }
}

impl ContactDirectory for MemoryContactDirectory {
    fn resolve_public_key(&self, identity: &Identity) -> Result<PublicKey, MissingPublicKey> {
        self.contacts
            .lock()
            .expect("MemoryContactDirectory mutex poisoned")
            .get(identity)
            .copied()
            .ok_or(MissingPublicKey { identity: *identity })
    }
}
