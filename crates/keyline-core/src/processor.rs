//! Forward-security processor.
//!
//! Ties the session store, nonce factory, message coder and message queue
//! together. Outgoing messages go through the best session with the peer
//! (initiating one when none exists); incoming boxes are checked for replay,
//! decrypted with the long-term keys or the session they name, and control
//! messages drive the session state machine.
//!
//! Like the rest of the crate the processor performs no I/O: every call
//! returns [`FsAction`]s for the caller to carry out.
//!
//! # Lock order
//!
//! handshake lock, then session store, then a single session. A session
//! lock is always released before the store is called again.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use keyline_crypto::RatchetError;

use crate::{
    coder::{MessageBox, MessageCoder, SessionHeader},
    config::Config,
    contacts::{Contact, ContactDirectory},
    env::Environment,
    error::{CoderError, ProcessorError, SessionError},
    event::{FsAction, FsEvent},
    identity::{Identity, IdentityStore, MessageId},
    message::{FsControl, Message, MessageBody, MessageFlags, RejectCause, TerminateCause},
    nonce::{NonceFactory, NonceStore},
    queue::MessageQueue,
    session::{DhSession, DhSessionStore, DhType, HandshakePayload, SessionId, SharedSession},
};

/// Result of decrypting a session box under the session lock.
enum Decrypted {
    Message { message: Message, skipped: u64, first_4dh: bool },
    Stale,
    Failed,
}

/// Forward-security layer for one local identity.
///
/// All methods take `&self`; the processor can be shared across worker
/// threads.
pub struct ForwardSecurityProcessor<N, D, E> {
    identity: Arc<dyn IdentityStore>,
    contacts: Arc<dyn ContactDirectory>,
    sessions: D,
    nonces: NonceFactory<N, E>,
    coder: MessageCoder<E>,
    queue: MessageQueue,
    env: E,
    config: Config,
    /// Serializes session creation so concurrent sends share one `Init`
    handshake: Mutex<()>,
    /// Peers that have sent us forward-secure traffic
    fs_peers: Mutex<HashSet<Identity>>,
}

impl<N, D, E> ForwardSecurityProcessor<N, D, E>
where
    N: NonceStore,
    D: DhSessionStore,
    E: Environment,
{
    /// Create a processor.
    ///
    /// Nonces are hashed with the local identity, so `nonce_store` must not
    /// be shared with another identity.
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        contacts: Arc<dyn ContactDirectory>,
        sessions: D,
        nonce_store: N,
        queue: MessageQueue,
        env: E,
        config: Config,
    ) -> Self {
        let config = config.normalized();
        let nonces = NonceFactory::new(identity.identity().as_bytes(), nonce_store, env.clone());
        let coder =
            MessageCoder::new(Arc::clone(&identity), Arc::clone(&contacts), env.clone(), config);

        Self {
            identity,
            contacts,
            sessions,
            nonces,
            coder,
            queue,
            env,
            config,
            handshake: Mutex::new(()),
            fs_peers: Mutex::new(HashSet::new()),
        }
    }

    /// Send `message` through the best session with its recipient.
    ///
    /// Starts a session (and emits its `Init` ahead of the message) when
    /// none exists. The box is tracked by the queue unless it carries
    /// `NO_SERVER_ACK`.
    ///
    /// # Errors
    ///
    /// - `NotSessionEligible`: forward-security control bodies
    /// - `MissingPublicKey`: recipient unknown
    /// - `Session`: the session could not produce a key (it is discarded)
    pub fn send(&self, message: Message) -> Result<Vec<FsAction>, ProcessorError> {
        if !message.body.allows_session() {
            return Err(ProcessorError::NotSessionEligible { message_id: message.id });
        }

        let peer = self.contacts.contact(&message.to)?;
        let message = self.with_nickname(message);

        let mut actions = Vec::new();
        let session = self.session_for_sending(&peer, &mut actions)?;

        let outgoing = lock(&session).next_outgoing_key();
        let key = match outgoing {
            Ok(key) => key,
            Err(err) => {
                let session_id = lock(&session).id();
                tracing::warn!(%session_id, peer = %peer.identity, %err, "cannot derive outgoing key");
                self.discard_session(&peer.identity, session_id);
                return Err(err.into());
            },
        };

        let nonce = self.nonces.next(false)?;
        let message_box = self.coder.encode_with_session(&message, nonce, &self.nonces, &key)?;

        tracing::debug!(
            message_id = %message.id,
            peer = %peer.identity,
            session_id = %key.session_id,
            dh_type = %key.dh_type,
            counter = key.counter,
            "encrypted message in session"
        );
        self.push_send(message_box, &mut actions);
        Ok(actions)
    }

    /// Send `message` with the long-term keys only.
    ///
    /// # Errors
    ///
    /// - `MissingPublicKey`: recipient unknown
    /// - `Coder`: nonce reuse or store failure
    pub fn send_without_session(&self, message: Message) -> Result<Vec<FsAction>, ProcessorError> {
        let message = self.with_nickname(message);
        let nonce = self.nonces.next(false)?;
        let message_box = self.coder.encode(&message, nonce, &self.nonces)?;

        let mut actions = Vec::new();
        self.push_send(message_box, &mut actions);
        Ok(actions)
    }

    /// Process an incoming box.
    ///
    /// The nonce is recorded before the box is handled, so the same box
    /// delivered again (or concurrently on another thread) fails with
    /// `Replay`. If handling fails with an error the nonce is released and
    /// the box can be retried.
    ///
    /// # Errors
    ///
    /// - `Replay`: the nonce was seen before
    /// - `MissingPublicKey`: sender unknown
    /// - `Coder`: long-term decryption failed or the body is malformed
    /// - `Session`: a control message could not be applied
    pub fn receive(&self, message_box: &MessageBox) -> Result<Vec<FsAction>, ProcessorError> {
        let message_id = message_box.message_id;
        if !self.nonces.store(&message_box.nonce)? {
            tracing::warn!(%message_id, sender = %message_box.from, "replayed nonce, dropping message");
            return Err(ProcessorError::Replay { message_id, sender: message_box.from });
        }

        let handled = match message_box.session {
            None => self.receive_long_term(message_box),
            Some(header) => self.receive_in_session(message_box, header),
        };

        if let Err(err) = &handled {
            match self.nonces.release(&message_box.nonce) {
                Ok(_) => tracing::debug!(%message_id, %err, "box not handled, nonce released"),
                Err(release_err) => {
                    tracing::warn!(%message_id, %err, %release_err, "cannot release nonce");
                },
            }
        }
        handled
    }

    /// Discard every session with `peer` and tell the peer why.
    ///
    /// With a renewing cause (`UnknownSession`, `Reset`) a fresh session is
    /// initiated once the old ones are gone.
    pub fn terminate(
        &self,
        peer: &Identity,
        cause: TerminateCause,
    ) -> Result<Vec<FsAction>, ProcessorError> {
        let contact = self.contacts.contact(peer)?;
        let _guard = self.handshake.lock().expect("handshake mutex poisoned");

        let mut actions = Vec::new();
        let terminated = self.sessions.delete_all(peer);
        for session_id in &terminated {
            let session_id = *session_id;
            self.queue.dequeue_session(session_id);
            self.send_control(*peer, FsControl::Terminate { session_id, cause }, &mut actions)?;
            tracing::info!(%session_id, %peer, %cause, "terminated session");
            actions.push(FsAction::Event(FsEvent::SessionTerminated {
                peer: *peer,
                session_id,
                cause,
            }));
        }

        if !terminated.is_empty() && cause.renews_session() {
            self.initiate(&contact, &mut actions)?;
        }
        Ok(actions)
    }

    /// Keep the session with `peer` alive.
    ///
    /// Sends an empty message through the best session, or initiates a
    /// session when there is none.
    pub fn refresh(&self, peer: &Identity) -> Result<Vec<FsAction>, ProcessorError> {
        let contact = self.contacts.contact(peer)?;
        {
            let _guard = self.handshake.lock().expect("handshake mutex poisoned");
            if self.sessions.best(peer).is_none() {
                let mut actions = Vec::new();
                self.initiate(&contact, &mut actions)?;
                return Ok(actions);
            }
        }

        let message = Message::new(
            self.identity.identity(),
            *peer,
            MessageId::random(&self.env),
            self.env.wall_clock_millis(),
            MessageBody::Empty,
        );
        tracing::debug!(%peer, message_id = %message.id, "refreshing session");
        self.send(message)
    }

    /// Whether `peer` has ever sent us forward-secure traffic.
    pub fn has_peer_used_forward_security(&self, peer: &Identity) -> bool {
        self.fs_peers.lock().expect("fs_peers mutex poisoned").contains(peer)
    }

    /// Outgoing message queue.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Session store.
    pub fn sessions(&self) -> &D {
        &self.sessions
    }

    /// Nonce factory shared by both directions.
    pub fn nonces(&self) -> &NonceFactory<N, E> {
        &self.nonces
    }

    fn session_for_sending(
        &self,
        peer: &Contact,
        actions: &mut Vec<FsAction>,
    ) -> Result<SharedSession, ProcessorError> {
        let _guard = self.handshake.lock().expect("handshake mutex poisoned");
        match self.sessions.best(&peer.identity) {
            Some(session) => Ok(session),
            None => self.initiate(peer, actions),
        }
    }

    /// Start a session with `peer` and queue its `Init`.
    ///
    /// Caller holds the handshake lock.
    fn initiate(
        &self,
        peer: &Contact,
        actions: &mut Vec<FsAction>,
    ) -> Result<SharedSession, ProcessorError> {
        let session = DhSession::initiate(peer, &*self.identity, self.config.versions, &self.env)?;
        let session_id = session.id();
        let init = FsControl::Init(HandshakePayload {
            session_id,
            versions: session.versions(),
            ephemeral_public_key: session.my_ephemeral_public_key(),
        });

        self.send_control(peer.identity, init, actions)?;
        let shared = self.sessions.store(session);

        tracing::info!(%session_id, peer = %peer.identity, "initiated session");
        actions.push(FsAction::Event(FsEvent::SessionInitiated { peer: peer.identity, session_id }));
        Ok(shared)
    }

    fn receive_long_term(&self, message_box: &MessageBox) -> Result<Vec<FsAction>, ProcessorError> {
        let message = self.coder.decode(message_box)?;
        let MessageBody::ForwardSecurity(control) = message.body else {
            let mut actions = Vec::new();
            if message.body.allows_session()
                && let Some(best) = self.sessions.best(&message.from)
            {
                let session_id = lock(&best).id();
                tracing::warn!(
                    %session_id,
                    peer = %message.from,
                    message_id = %message.id,
                    "message without forward security from session peer"
                );
                actions.push(FsAction::Event(FsEvent::MessageWithoutForwardSecurity {
                    peer: message.from,
                    session_id,
                    message_id: message.id,
                }));
            }
            push_deliver(message, &mut actions);
            return Ok(actions);
        };

        let peer = self.contacts.contact(&message.from)?;
        match control {
            FsControl::Init(payload) => self.handle_init(&peer, payload),
            FsControl::Accept(payload) => self.handle_accept(&peer, payload),
            FsControl::Reject { session_id, rejected_message_id, cause } => {
                tracing::warn!(
                    %session_id,
                    peer = %peer.identity,
                    %rejected_message_id,
                    %cause,
                    "peer rejected message"
                );
                self.discard_session(&peer.identity, session_id);
                Ok(vec![FsAction::Event(FsEvent::RejectReceived {
                    peer: peer.identity,
                    session_id,
                    rejected_message_id,
                    cause,
                })])
            },
            FsControl::Terminate { session_id, cause } => {
                tracing::info!(%session_id, peer = %peer.identity, %cause, "peer terminated session");
                self.discard_session(&peer.identity, session_id);
                Ok(vec![FsAction::Event(FsEvent::SessionTerminated {
                    peer: peer.identity,
                    session_id,
                    cause,
                })])
            },
        }
    }

    fn handle_init(
        &self,
        peer: &Contact,
        payload: HandshakePayload,
    ) -> Result<Vec<FsAction>, ProcessorError> {
        let _guard = self.handshake.lock().expect("handshake mutex poisoned");
        let session_id = payload.session_id;

        if self.sessions.get(&peer.identity, &session_id).is_some() {
            tracing::debug!(%session_id, peer = %peer.identity, "duplicate Init ignored");
            return Ok(Vec::new());
        }

        let session = DhSession::respond(
            session_id,
            payload.versions,
            &payload.ephemeral_public_key,
            peer,
            &*self.identity,
            self.config.versions,
            &self.env,
        )?;
        let accept = FsControl::Accept(HandshakePayload {
            session_id,
            versions: session.versions(),
            ephemeral_public_key: session.my_ephemeral_public_key(),
        });

        let mut actions = Vec::new();
        self.send_control(peer.identity, accept, &mut actions)?;

        // An Init means the peer has no session with us, so our 4-DH
        // sessions are stale. 2-DH sessions we initiated may still be
        // accepted and stay.
        let evicted = self.sessions.delete_all_except(&peer.identity, &session_id, true);
        for evicted_id in &evicted {
            self.queue.dequeue_session(*evicted_id);
        }
        self.sessions.store(session);
        self.mark_fs_peer(peer.identity);

        let preempted = !evicted.is_empty();
        tracing::info!(%session_id, peer = %peer.identity, preempted, "accepted session");
        actions.push(FsAction::Event(FsEvent::ResponderSessionEstablished {
            peer: peer.identity,
            session_id,
            preempted,
        }));
        Ok(actions)
    }

    fn handle_accept(
        &self,
        peer: &Contact,
        payload: HandshakePayload,
    ) -> Result<Vec<FsAction>, ProcessorError> {
        let _guard = self.handshake.lock().expect("handshake mutex poisoned");
        let session_id = payload.session_id;

        let Some(session) = self.sessions.get(&peer.identity, &session_id) else {
            tracing::warn!(%session_id, peer = %peer.identity, "Accept for unknown session");
            let terminate =
                FsControl::Terminate { session_id, cause: TerminateCause::UnknownSession };
            let mut actions = Vec::new();
            self.send_control(peer.identity, terminate, &mut actions)?;
            actions
                .push(FsAction::Event(FsEvent::SessionNotFound { peer: peer.identity, session_id }));
            if self.sessions.best(&peer.identity).is_none() {
                self.initiate(peer, &mut actions)?;
            }
            return Ok(actions);
        };

        let accepted = lock(&session).process_accept(
            payload.versions,
            &payload.ephemeral_public_key,
            peer,
            &*self.identity,
        );
        match accepted {
            Ok(()) => {},
            // Repeated Accept for a session that is already 4-DH
            Err(err @ SessionError::MissingEphemeralPrivateKey { .. }) => {
                tracing::debug!(%session_id, peer = %peer.identity, "duplicate Accept ignored");
                return Err(err.into());
            },
            Err(err) => {
                tracing::warn!(%session_id, peer = %peer.identity, %err, "Accept failed");
                self.discard_session(&peer.identity, session_id);
                return Err(err.into());
            },
        }

        self.mark_fs_peer(peer.identity);
        tracing::info!(%session_id, peer = %peer.identity, "session established with 4DH");
        Ok(vec![FsAction::Event(FsEvent::InitiatorSessionEstablished {
            peer: peer.identity,
            session_id,
        })])
    }

    fn receive_in_session(
        &self,
        message_box: &MessageBox,
        header: SessionHeader,
    ) -> Result<Vec<FsAction>, ProcessorError> {
        let peer = message_box.from;
        let session_id = header.session_id;
        let message_id = message_box.message_id;

        // Unknown senders fail before any ratchet moves.
        self.contacts.resolve_public_key(&peer)?;

        let Some(session) = self.sessions.get(&peer, &session_id) else {
            tracing::warn!(%session_id, %peer, %message_id, "no session for message");
            let mut actions = Vec::new();
            self.send_reject(peer, session_id, message_id, RejectCause::UnknownSession, &mut actions)?;
            actions.push(FsAction::Event(FsEvent::SessionNotFound { peer, session_id }));
            return Ok(actions);
        };

        let (message, skipped, first_4dh) = match self.decrypt(&session, message_box, header)? {
            Decrypted::Message { message, skipped, first_4dh } => (message, skipped, first_4dh),
            Decrypted::Stale => {
                tracing::warn!(%session_id, %peer, %message_id, counter = header.counter, "message out of order");
                return Ok(vec![FsAction::Event(FsEvent::MessageOutOfOrder {
                    peer,
                    session_id,
                    message_id,
                })]);
            },
            Decrypted::Failed => {
                let cause = RejectCause::StateMismatch;
                self.discard_session(&peer, session_id);

                let mut actions = Vec::new();
                self.send_reject(peer, session_id, message_id, cause, &mut actions)?;
                actions.push(FsAction::Event(FsEvent::DecryptionFailed {
                    peer,
                    session_id,
                    message_id,
                    cause,
                }));
                return Ok(actions);
            },
        };

        let mut actions = Vec::new();
        if skipped > 0 {
            actions.push(FsAction::Event(FsEvent::MessagesSkipped {
                peer,
                session_id,
                count: skipped,
            }));
        }

        if header.dh_type == DhType::FourDh {
            if first_4dh {
                actions.push(FsAction::Event(FsEvent::First4DhMessageReceived { peer, session_id }));
            }

            // Both sides agree on the best session, so a 4-DH message in it
            // means every other session is obsolete.
            let is_best =
                self.sessions.best(&peer).is_some_and(|best| Arc::ptr_eq(&best, &session));
            if is_best {
                for evicted_id in self.sessions.delete_all_except(&peer, &session_id, false) {
                    self.queue.dequeue_session(evicted_id);
                }
            }
        }

        self.mark_fs_peer(peer);
        tracing::debug!(%message_id, %peer, %session_id, dh_type = %header.dh_type, "decrypted message in session");
        push_deliver(message, &mut actions);
        Ok(actions)
    }

    /// Derive the key, decrypt and advance the peer ratchet, all under the
    /// session lock.
    fn decrypt(
        &self,
        session: &SharedSession,
        message_box: &MessageBox,
        header: SessionHeader,
    ) -> Result<Decrypted, ProcessorError> {
        let mut guard = lock(session);

        let (key, skipped) = match guard.incoming_key(header.dh_type, header.counter) {
            Ok(found) => found,
            Err(SessionError::Ratchet { source: RatchetError::CannotRewind { .. }, .. }) => {
                return Ok(Decrypted::Stale);
            },
            Err(err) => {
                tracing::warn!(message_id = %message_box.message_id, %err, "no key for message");
                return Ok(Decrypted::Failed);
            },
        };

        let message = match self.coder.decode_with_session(message_box, &key) {
            Ok(message) => message,
            Err(CoderError::MissingPublicKey(err)) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(message_id = %message_box.message_id, %err, "session decryption failed");
                return Ok(Decrypted::Failed);
            },
        };

        let first_4dh = guard.complete_incoming(header.dh_type)?;
        Ok(Decrypted::Message { message, skipped, first_4dh })
    }

    fn send_reject(
        &self,
        peer: Identity,
        session_id: SessionId,
        rejected_message_id: MessageId,
        cause: RejectCause,
        actions: &mut Vec<FsAction>,
    ) -> Result<(), ProcessorError> {
        let reject = FsControl::Reject { session_id, rejected_message_id, cause };
        self.send_control(peer, reject, actions)
    }

    /// Encode a control message with the long-term keys and queue it.
    fn send_control(
        &self,
        peer: Identity,
        control: FsControl,
        actions: &mut Vec<FsAction>,
    ) -> Result<(), ProcessorError> {
        let message = Message::new(
            self.identity.identity(),
            peer,
            MessageId::random(&self.env),
            self.env.wall_clock_millis(),
            MessageBody::ForwardSecurity(control),
        );

        let nonce = self.nonces.next(false)?;
        let message_box = self.coder.encode(&message, nonce, &self.nonces)?;

        tracing::debug!(%peer, session_id = %control.session_id(), message_id = %message.id, "sending control message");
        self.push_send(message_box, actions);
        Ok(())
    }

    fn push_send(&self, message_box: MessageBox, actions: &mut Vec<FsAction>) {
        if !message_box.flags.contains(MessageFlags::NO_SERVER_ACK) {
            self.queue.enqueue(message_box.clone());
        }
        actions.push(FsAction::Send(message_box));
    }

    fn discard_session(&self, peer: &Identity, session_id: SessionId) {
        if !self.sessions.delete(peer, &session_id) {
            tracing::debug!(%session_id, %peer, "session already gone");
        }
        self.queue.dequeue_session(session_id);
    }

    fn mark_fs_peer(&self, peer: Identity) {
        self.fs_peers.lock().expect("fs_peers mutex poisoned").insert(peer);
    }

    fn with_nickname(&self, mut message: Message) -> Message {
        if message.nickname.as_deref().is_none_or(str::is_empty) {
            message.nickname = self.identity.nickname().filter(|nickname| !nickname.is_empty());
        }
        message
    }
}

/// Hand `message` to the application. Empty messages only move the
/// ratchet and are not delivered.
fn push_deliver(message: Message, actions: &mut Vec<FsAction>) {
    if !matches!(message.body, MessageBody::Empty) {
        actions.push(FsAction::Deliver(message));
    }
}

fn lock(session: &SharedSession) -> MutexGuard<'_, DhSession> {
    session.lock().expect("DhSession mutex poisoned")
}
