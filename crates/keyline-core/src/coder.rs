//! Message coder: plaintext messages to authenticated boxes and back.
//!
//! Plaintext layout before encryption:
//!
//! ```text
//! message_id (8, LE) | created_at_ms (8, BE) | nickname_len (1) | nickname
//!   | type (1) | body | padding
//! ```
//!
//! Padding is PKCS#7 style: `n` bytes of value `n`, `n` random in
//! `1..=255`, raised so the padded plaintext is at least
//! [`Config::min_padded_len`] bytes.
//!
//! A nickname is optional; an empty nickname is written as length 0 and
//! decodes as `None`.
//!
//! Two paths share the layout: the long-term path encrypts with the
//! identities' long-term keys, the forward-secure path with a session
//! ratchet key.

use std::sync::Arc;

use keyline_crypto::{Nonce, open, seal};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    contacts::ContactDirectory,
    env::Environment,
    error::CoderError,
    identity::{Identity, IdentityStore, MessageId},
    message::{Message, MessageBody, MessageFlags},
    nonce::{NonceFactory, NonceStore},
    session::{DhType, SessionId, SessionKey},
};

/// Longest nickname carried in a message (bytes).
pub const MAX_NICKNAME_LEN: usize = 32;

/// Fixed header: message id, timestamp, nickname length
const HEADER_LEN: usize = 8 + 8 + 1;

/// Ratchet position a session box was encrypted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Session used
    pub session_id: SessionId,
    /// Ratchet family used
    pub dh_type: DhType,
    /// Ratchet counter used
    pub counter: u64,
}

/// An encrypted message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBox {
    /// Sender
    pub from: Identity,
    /// Recipient
    pub to: Identity,
    /// Message id (repeated inside the ciphertext)
    pub message_id: MessageId,
    /// Delivery flags
    pub flags: MessageFlags,
    /// Present for forward-secure boxes
    pub session: Option<SessionHeader>,
    /// Nonce used for encryption
    pub nonce: Nonce,
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

/// Encodes and decodes message boxes for one local identity.
///
/// Performs no I/O: public keys come from the contact directory, nonces are
/// supplied by the caller and recorded through its [`NonceFactory`].
pub struct MessageCoder<E> {
    identity: Arc<dyn IdentityStore>,
    contacts: Arc<dyn ContactDirectory>,
    env: E,
    config: Config,
}

impl<E: Environment> MessageCoder<E> {
    /// Create a coder.
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        contacts: Arc<dyn ContactDirectory>,
        env: E,
        config: Config,
    ) -> Self {
        Self { identity, contacts, env, config: config.normalized() }
    }

    /// Encode with the long-term keys.
    ///
    /// `nonce` must come from `nonces.next(false)`; it is recorded here
    /// (or, for `NO_SERVER_QUEUING` messages, only checked).
    ///
    /// # Errors
    ///
    /// - `MissingPublicKey`: recipient unknown
    /// - `NonceReused`: `nonce` is already recorded
    pub fn encode<S, NE>(
        &self,
        message: &Message,
        nonce: Nonce,
        nonces: &NonceFactory<S, NE>,
    ) -> Result<MessageBox, CoderError>
    where
        S: NonceStore,
        NE: Environment,
    {
        let recipient = self.contacts.resolve_public_key(&message.to)?;
        let plaintext = self.plaintext(message);
        commit_nonce(message, &nonce, nonces)?;

        let ciphertext = self.identity.encrypt(&plaintext, &nonce, &recipient)?;
        Ok(boxed(message, None, nonce, ciphertext))
    }

    /// Encode with a session key.
    ///
    /// Same nonce contract as [`encode`](Self::encode). The box records the
    /// ratchet position of `key` so the recipient can derive the same key.
    pub fn encode_with_session<S, NE>(
        &self,
        message: &Message,
        nonce: Nonce,
        nonces: &NonceFactory<S, NE>,
        key: &SessionKey,
    ) -> Result<MessageBox, CoderError>
    where
        S: NonceStore,
        NE: Environment,
    {
        self.contacts.resolve_public_key(&message.to)?;
        let plaintext = self.plaintext(message);
        commit_nonce(message, &nonce, nonces)?;

        let ciphertext = seal(key.key.as_bytes(), &nonce, &plaintext);
        let header =
            SessionHeader { session_id: key.session_id, dh_type: key.dh_type, counter: key.counter };
        Ok(boxed(message, Some(header), nonce, ciphertext))
    }

    /// Decode a long-term box.
    ///
    /// # Errors
    ///
    /// - `MissingPublicKey`: sender unknown
    /// - `BadMessage`: wrong recipient, session box, failed authentication or
    ///   malformed plaintext
    pub fn decode(&self, message_box: &MessageBox) -> Result<Message, CoderError> {
        self.check_recipient(message_box)?;
        if message_box.session.is_some() {
            return Err(bad(message_box, "session box without session key"));
        }

        let sender = self.contacts.resolve_public_key(&message_box.from)?;
        let plaintext = self
            .identity
            .decrypt(&message_box.ciphertext, &message_box.nonce, &sender)
            .map_err(|_| bad(message_box, "authentication failed"))?;

        parse_plaintext(message_box, &plaintext)
    }

    /// Decode a session box with the key for its ratchet position.
    pub fn decode_with_session(
        &self,
        message_box: &MessageBox,
        key: &SessionKey,
    ) -> Result<Message, CoderError> {
        self.check_recipient(message_box)?;
        let expected =
            SessionHeader { session_id: key.session_id, dh_type: key.dh_type, counter: key.counter };
        if message_box.session != Some(expected) {
            return Err(bad(message_box, "session key does not match box"));
        }

        self.contacts.resolve_public_key(&message_box.from)?;
        let plaintext = open(key.key.as_bytes(), &message_box.nonce, &message_box.ciphertext)
            .map_err(|_| bad(message_box, "authentication failed"))?;

        parse_plaintext(message_box, &plaintext)
    }

    fn check_recipient(&self, message_box: &MessageBox) -> Result<(), CoderError> {
        if message_box.to != self.identity.identity() {
            return Err(bad(message_box, "wrong recipient"));
        }
        Ok(())
    }

    fn plaintext(&self, message: &Message) -> Vec<u8> {
        let nickname = message.nickname.as_deref().map_or("", truncate_nickname);

        let mut out = Vec::with_capacity(HEADER_LEN + nickname.len() + 64);
        out.extend_from_slice(&message.id.to_le_bytes());
        out.extend_from_slice(&message.created_at.to_be_bytes());
        out.push(nickname.len() as u8);
        out.extend_from_slice(nickname.as_bytes());
        out.push(message.body.type_byte());
        message.body.encode(&mut out);

        let [random] = self.env.random_array::<1>();
        let random_len = usize::from(random % 255) + 1;
        let needed = self.config.min_padded_len.saturating_sub(out.len());
        let pad_len = random_len.max(needed).min(255);
        out.resize(out.len() + pad_len, pad_len as u8);
        out
    }
}

/// Record or check the nonce according to the message's queuing flags.
fn commit_nonce<S, NE>(
    message: &Message,
    nonce: &Nonce,
    nonces: &NonceFactory<S, NE>,
) -> Result<(), CoderError>
where
    S: NonceStore,
    NE: Environment,
{
    let fresh = if message.flags.contains(MessageFlags::NO_SERVER_QUEUING) {
        !nonces.exists(nonce)?
    } else {
        nonces.store(nonce)?
    };

    if !fresh {
        tracing::warn!(message_id = %message.id, "refusing to reuse nonce");
        return Err(CoderError::NonceReused { message_id: message.id });
    }
    Ok(())
}

fn boxed(
    message: &Message,
    session: Option<SessionHeader>,
    nonce: Nonce,
    ciphertext: Vec<u8>,
) -> MessageBox {
    MessageBox {
        from: message.from,
        to: message.to,
        message_id: message.id,
        flags: message.flags,
        session,
        nonce,
        ciphertext,
    }
}

fn bad(message_box: &MessageBox, reason: &'static str) -> CoderError {
    CoderError::BadMessage { message_id: message_box.message_id, reason }
}

fn truncate_nickname(nickname: &str) -> &str {
    if nickname.len() <= MAX_NICKNAME_LEN {
        return nickname;
    }
    let mut end = MAX_NICKNAME_LEN;
    while !nickname.is_char_boundary(end) {
        end -= 1;
    }
    &nickname[..end]
}

fn strip_padding(plaintext: &[u8]) -> Option<&[u8]> {
    let &pad = plaintext.last()?;
    let pad_len = usize::from(pad);
    if pad_len == 0 || pad_len > plaintext.len() {
        return None;
    }

    let (content, padding) = plaintext.split_at(plaintext.len() - pad_len);
    padding.iter().all(|&b| b == pad).then_some(content)
}

fn parse_plaintext(message_box: &MessageBox, plaintext: &[u8]) -> Result<Message, CoderError> {
    let content = strip_padding(plaintext).ok_or_else(|| bad(message_box, "bad padding"))?;
    if content.len() < HEADER_LEN + 1 {
        return Err(bad(message_box, "truncated plaintext"));
    }

    let (id, rest) = content.split_at(8);
    let (created_at, rest) = rest.split_at(8);
    let Ok(id) = <[u8; 8]>::try_from(id) else {
        unreachable!("split_at yields 8 bytes");
    };
    let Ok(created_at) = <[u8; 8]>::try_from(created_at) else {
        unreachable!("split_at yields 8 bytes");
    };

    if MessageId::from_le_bytes(id) != message_box.message_id {
        return Err(bad(message_box, "message id mismatch"));
    }

    let nickname_len = usize::from(rest[0]);
    let rest = &rest[1..];
    if nickname_len > MAX_NICKNAME_LEN || rest.len() < nickname_len + 1 {
        return Err(bad(message_box, "bad nickname length"));
    }
    let (nickname, rest) = rest.split_at(nickname_len);
    let nickname = std::str::from_utf8(nickname)
        .map_err(|_| bad(message_box, "nickname not UTF-8"))?
        .to_owned();

    let body = MessageBody::decode(rest[0], &rest[1..])
        .map_err(|err| bad(message_box, err.reason))?;

    Ok(Message {
        from: message_box.from,
        to: message_box.to,
        id: message_box.message_id,
        created_at: u64::from_be_bytes(created_at),
        flags: message_box.flags,
        nickname: (!nickname.is_empty()).then_some(nickname),
        body,
    })
}
