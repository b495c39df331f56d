//! Message coder round trips
//!
//! Every message kind must survive encode then decode unchanged on both the
//! long-term path and the forward-secure path, with keys taken from a real
//! session pair.

use std::sync::Arc;

use keyline_core::{
    CoderError, Config, Contact, ContactDirectory, DhSession, FsControl, HandshakePayload,
    Identity, IdentityStore, LocalIdentity, Location, MemoryContactDirectory, MemoryNonceStore,
    Message, MessageBody, MessageCoder, MessageId, NonceFactory, ReceiptType, RejectCause,
    SeededEnv, SessionId, TerminateCause, VersionRange,
};

struct Parties {
    alice: LocalIdentity,
    bob: LocalIdentity,
    alice_coder: MessageCoder<SeededEnv>,
    bob_coder: MessageCoder<SeededEnv>,
    nonces: NonceFactory<MemoryNonceStore, SeededEnv>,
    env: SeededEnv,
}

impl Parties {
    fn new(config: Config) -> Self {
        let env = SeededEnv::new(2024);
        let alice = LocalIdentity::generate(Identity::new("ALICE001").unwrap(), &env)
            .with_nickname("Alice");
        let bob = LocalIdentity::generate(Identity::new("BOB00001").unwrap(), &env);

        let contacts = MemoryContactDirectory::new();
        contacts.add(contact(&alice));
        contacts.add(contact(&bob));
        let contacts: Arc<dyn ContactDirectory> = Arc::new(contacts);

        Self {
            alice_coder: MessageCoder::new(
                Arc::new(alice.clone()),
                Arc::clone(&contacts),
                env.clone(),
                config,
            ),
            bob_coder: MessageCoder::new(Arc::new(bob.clone()), contacts, env.clone(), config),
            nonces: NonceFactory::new(alice.identity().as_bytes(), MemoryNonceStore::new(), env.clone()),
            alice,
            bob,
            env,
        }
    }

    fn sessions(&self) -> (DhSession, DhSession) {
        let mut initiator =
            DhSession::initiate(&contact(&self.bob), &self.alice, VersionRange::SUPPORTED, &self.env)
                .unwrap();
        let responder = DhSession::respond(
            initiator.id(),
            initiator.versions(),
            &initiator.my_ephemeral_public_key(),
            &contact(&self.alice),
            &self.bob,
            VersionRange::SUPPORTED,
            &self.env,
        )
        .unwrap();
        initiator
            .process_accept(
                responder.versions(),
                &responder.my_ephemeral_public_key(),
                &contact(&self.bob),
                &self.alice,
            )
            .unwrap();
        (initiator, responder)
    }

    fn message(&self, id: u64, body: MessageBody) -> Message {
        Message::new(self.alice.identity(), self.bob.identity(), MessageId::new(id), 1_700_000_123_456, body)
            .with_nickname("Alice")
    }
}

fn contact(identity: &LocalIdentity) -> Contact {
    Contact { identity: identity.identity(), public_key: identity.public_key() }
}

fn every_kind() -> Vec<MessageBody> {
    let payload = HandshakePayload {
        session_id: SessionId::from_bytes([0x42; 16]),
        versions: VersionRange::SUPPORTED,
        ephemeral_public_key: LocalIdentity::generate(
            Identity::new("EPHEMERL").unwrap(),
            &SeededEnv::new(1),
        )
        .public_key(),
    };

    vec![
        MessageBody::Text("hello, 世界".to_string()),
        MessageBody::Text(String::new()),
        MessageBody::Location(Location {
            latitude: 47.3769,
            longitude: 8.5417,
            accuracy: Some(12.5),
            name: Some("Zürich HB".to_string()),
        }),
        MessageBody::Location(Location {
            latitude: -33.8688,
            longitude: 151.2093,
            accuracy: None,
            name: None,
        }),
        MessageBody::DeliveryReceipt {
            receipt_type: ReceiptType::Read,
            message_ids: vec![MessageId::new(1), MessageId::new(u64::MAX)],
        },
        MessageBody::TypingIndicator(true),
        MessageBody::TypingIndicator(false),
        MessageBody::ForwardSecurity(FsControl::Init(payload)),
        MessageBody::ForwardSecurity(FsControl::Accept(payload)),
        MessageBody::ForwardSecurity(FsControl::Reject {
            session_id: payload.session_id,
            rejected_message_id: MessageId::new(77),
            cause: RejectCause::StateMismatch,
        }),
        MessageBody::ForwardSecurity(FsControl::Terminate {
            session_id: payload.session_id,
            cause: TerminateCause::UnknownSession,
        }),
        MessageBody::Empty,
    ]
}

#[test]
fn every_kind_round_trips_on_long_term_path() {
    let parties = Parties::new(Config::default());

    for (id, body) in every_kind().into_iter().enumerate() {
        let message = parties.message(id as u64, body);
        let nonce = parties.nonces.next(false).unwrap();
        let boxed = parties.alice_coder.encode(&message, nonce, &parties.nonces).unwrap();

        assert!(boxed.session.is_none());
        assert_eq!(boxed.flags, message.flags);
        assert_eq!(parties.bob_coder.decode(&boxed).unwrap(), message);
    }
}

#[test]
fn every_session_kind_round_trips_on_session_path() {
    let parties = Parties::new(Config::default());
    let (mut alice_session, mut bob_session) = parties.sessions();

    let session_kinds = every_kind().into_iter().filter(MessageBody::allows_session);
    for (id, body) in session_kinds.enumerate() {
        let message = parties.message(id as u64, body);
        let key = alice_session.next_outgoing_key().unwrap();
        let nonce = parties.nonces.next(false).unwrap();
        let boxed =
            parties.alice_coder.encode_with_session(&message, nonce, &parties.nonces, &key).unwrap();

        let header = boxed.session.unwrap();
        let (incoming, skipped) = bob_session.incoming_key(header.dh_type, header.counter).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(parties.bob_coder.decode_with_session(&boxed, &incoming).unwrap(), message);
        bob_session.complete_incoming(header.dh_type).unwrap();
    }
}

#[test]
fn large_minimum_padding_still_round_trips() {
    let config = Config { min_padded_len: 200, ..Config::default() };
    let parties = Parties::new(config);
    let message = parties.message(1, MessageBody::Text("short".to_string()));

    let nonce = parties.nonces.next(false).unwrap();
    let boxed = parties.alice_coder.encode(&message, nonce, &parties.nonces).unwrap();
    assert!(boxed.ciphertext.len() >= 200);
    assert_eq!(parties.bob_coder.decode(&boxed).unwrap(), message);
}

#[test]
fn session_box_fails_with_wrong_key() {
    let parties = Parties::new(Config::default());
    let (mut alice_session, mut bob_session) = parties.sessions();

    let message = parties.message(1, MessageBody::Text("secret".to_string()));
    let first = alice_session.next_outgoing_key().unwrap();
    let second = alice_session.next_outgoing_key().unwrap();
    let nonce = parties.nonces.next(false).unwrap();
    let boxed =
        parties.alice_coder.encode_with_session(&message, nonce, &parties.nonces, &second).unwrap();

    // Key for the earlier position does not open the later box.
    let (wrong, _) = bob_session.incoming_key(first.dh_type, first.counter).unwrap();
    let result = parties.bob_coder.decode_with_session(&boxed, &wrong);
    assert!(matches!(result, Err(CoderError::BadMessage { .. })));
}

#[test]
fn reused_nonce_is_refused() {
    let parties = Parties::new(Config::default());
    let message = parties.message(1, MessageBody::Text("once".to_string()));

    let nonce = parties.nonces.next(false).unwrap();
    parties.alice_coder.encode(&message, nonce, &parties.nonces).unwrap();
    let again = parties.alice_coder.encode(&message, nonce, &parties.nonces);
    assert!(matches!(again, Err(CoderError::NonceReused { .. })));
}
