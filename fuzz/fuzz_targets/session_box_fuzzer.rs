//! Fuzz target for ForwardSecurityProcessor::receive
//!
//! A relay (or anyone on the path) can hand the processor arbitrary boxes.
//! Tests:
//! - Arbitrary session headers (unknown ids, both DH types, any counter)
//! - Arbitrary ciphertext on both the long-term and the session path
//! - Boxes aimed at a live 4-DH session
//!
//! The fuzzer should NEVER panic. Forged boxes must never be delivered.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use keyline_core::{
    Config, Contact, DhSessionStore, DhType, ForwardSecurityProcessor, FsAction, Identity,
    IdentityStore, LocalIdentity, MemoryContactDirectory, MemoryNonceStore, MemorySessionStore,
    Message, MessageBody, MessageBox, MessageFlags, MessageId, MessageQueue, SeededEnv,
    SessionHeader, SessionId,
};
use keyline_crypto::Nonce;
use libfuzzer_sys::fuzz_target;

type Processor = ForwardSecurityProcessor<MemoryNonceStore, MemorySessionStore, SeededEnv>;

#[derive(Debug, Clone, Arbitrary)]
struct ForgedBox {
    message_id: u64,
    flags: u8,
    header: Option<ForgedHeader>,
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Arbitrary)]
struct ForgedHeader {
    /// Target the live session instead of a random id
    live_session: bool,
    session_id: [u8; 16],
    four_dh: bool,
    counter: u64,
}

fn processor(name: &str, seed: u64, contacts: &MemoryContactDirectory) -> (Identity, Processor) {
    let env = SeededEnv::new(seed);
    let local = LocalIdentity::generate(Identity::new(name).expect("valid identity"), &env);
    contacts.add(Contact { identity: local.identity(), public_key: local.public_key() });

    let processor = ForwardSecurityProcessor::new(
        Arc::new(local.clone()),
        Arc::new(contacts.clone()),
        MemorySessionStore::new(),
        MemoryNonceStore::new(),
        MessageQueue::new(),
        env,
        Config::default(),
    );
    (local.identity(), processor)
}

fuzz_target!(|forged: ForgedBox| {
    let contacts = MemoryContactDirectory::new();
    let (alice, alice_processor) = processor("ALICE001", 1, &contacts);
    let (bob, bob_processor) = processor("BOB00001", 2, &contacts);

    // Establish a 4-DH session so forged boxes can aim at it.
    let hello = Message::new(alice, bob, MessageId::new(1), 0, MessageBody::Text("hi".into()));
    let sent = alice_processor.send(hello).expect("send succeeds");
    for action in sent {
        if let FsAction::Send(message_box) = action {
            for reply in bob_processor.receive(&message_box).expect("receive succeeds") {
                if let FsAction::Send(reply) = reply {
                    alice_processor.receive(&reply).expect("accept succeeds");
                }
            }
        }
    }

    let live = bob_processor
        .sessions()
        .best(&alice)
        .map(|session| session.lock().expect("session lock").id());

    let session = forged.header.map(|header| SessionHeader {
        session_id: match (header.live_session, live) {
            (true, Some(id)) => id,
            _ => SessionId::from_bytes(header.session_id),
        },
        dh_type: if header.four_dh { DhType::FourDh } else { DhType::TwoDh },
        counter: header.counter,
    });

    let message_box = MessageBox {
        from: alice,
        to: bob,
        message_id: MessageId::new(forged.message_id),
        flags: MessageFlags::from_bits(forged.flags),
        session,
        nonce: Nonce::from_bytes(forged.nonce),
        ciphertext: forged.ciphertext,
    };

    if let Ok(actions) = bob_processor.receive(&message_box) {
        assert!(
            !actions.iter().any(|action| matches!(action, FsAction::Deliver(_))),
            "forged box was delivered"
        );
    }
});
