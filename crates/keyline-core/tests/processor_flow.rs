//! End-to-end processor flows over an in-memory relay
//!
//! # Oracle Pattern
//!
//! Tests end with oracle checks that verify:
//! - Every message is delivered at most once, with its original content
//! - Both sides agree on a single 4-DH session once traffic settles
//! - Acknowledged boxes leave the sender's queue
//! - A box received on several threads at once is handled exactly once

use std::{
    sync::{Arc, Barrier},
    thread,
};

use keyline_core::{
    Config, Contact, DhSessionStore, DhType, ForwardSecurityProcessor, FsAction, FsEvent, Identity,
    IdentityStore, LocalIdentity, MemoryContactDirectory, MemoryNonceStore, MemorySessionStore,
    Message, MessageBody, MessageBox, MessageId, MessageQueue, ProcessorError, QueueMessageId,
    SeededEnv,
};
use proptest::prelude::*;

type Processor = ForwardSecurityProcessor<MemoryNonceStore, MemorySessionStore, SeededEnv>;

struct Peer {
    identity: Identity,
    processor: Processor,
    sessions: MemorySessionStore,
    queue: MessageQueue,
    next_id: u64,
}

impl Peer {
    fn text(&mut self, to: Identity, text: &str) -> Message {
        self.next_id += 1;
        Message::new(
            self.identity,
            to,
            MessageId::new(self.next_id),
            1_700_000_000_000,
            MessageBody::Text(text.to_string()),
        )
    }
}

fn peers(seed: u64) -> (Peer, Peer) {
    let contacts = MemoryContactDirectory::new();
    let build = |name: &str, seed: u64| {
        let env = SeededEnv::new(seed);
        let identity = LocalIdentity::generate(Identity::new(name).unwrap(), &env);
        contacts.add(Contact { identity: identity.identity(), public_key: identity.public_key() });

        let sessions = MemorySessionStore::new();
        let queue = MessageQueue::new();
        let processor = ForwardSecurityProcessor::new(
            Arc::new(identity.clone()),
            Arc::new(contacts.clone()),
            sessions.clone(),
            MemoryNonceStore::new(),
            queue.clone(),
            env,
            Config::default(),
        );
        Peer { identity: identity.identity(), processor, sessions, queue, next_id: 0 }
    };

    let alice = build("ALICE001", seed);
    let bob = build("BOB00001", seed.wrapping_add(1));
    (alice, bob)
}

fn boxes(actions: &[FsAction]) -> Vec<MessageBox> {
    actions
        .iter()
        .filter_map(|action| match action {
            FsAction::Send(message_box) => Some(message_box.clone()),
            _ => None,
        })
        .collect()
}

fn texts(actions: &[FsAction]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|action| match action {
            FsAction::Deliver(Message { body: MessageBody::Text(text), .. }) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Deliver `outgoing` from `sender` to `recipient`, acking each box the way
/// the relay would, and return the recipient's actions.
fn relay(sender: &Peer, recipient: &Peer, outgoing: &[FsAction]) -> Vec<FsAction> {
    let mut actions = Vec::new();
    for message_box in boxes(outgoing) {
        actions.extend(recipient.processor.receive(&message_box).unwrap());
        sender.queue.process_ack(&QueueMessageId::of(&message_box));
    }
    actions
}

fn best_session(peer: &Peer, other: &Peer) -> Option<keyline_core::SessionId> {
    let best = peer.sessions.best(&other.identity)?;
    let id = best.lock().unwrap().id();
    Some(id)
}

#[test]
fn conversation_settles_on_one_session_and_drains_queues() {
    let (mut alice, mut bob) = peers(7);

    let mut alice_inbox = Vec::new();
    let mut bob_inbox = Vec::new();
    for round in 0..20 {
        let message = alice.text(bob.identity, &format!("a{round}"));
        let sent = alice.processor.send(message).unwrap();
        let replies = relay(&alice, &bob, &sent);
        bob_inbox.extend(texts(&replies));
        alice_inbox.extend(texts(&relay(&bob, &alice, &replies)));

        let message = bob.text(alice.identity, &format!("b{round}"));
        let sent = bob.processor.send(message).unwrap();
        let replies = relay(&bob, &alice, &sent);
        alice_inbox.extend(texts(&replies));
        bob_inbox.extend(texts(&relay(&alice, &bob, &replies)));
    }

    let expected_bob: Vec<String> = (0..20).map(|round| format!("a{round}")).collect();
    let expected_alice: Vec<String> = (0..20).map(|round| format!("b{round}")).collect();
    assert_eq!(bob_inbox, expected_bob);
    assert_eq!(alice_inbox, expected_alice);

    assert_eq!(alice.sessions.session_count(&bob.identity), 1);
    assert_eq!(bob.sessions.session_count(&alice.identity), 1);
    assert_eq!(best_session(&alice, &bob), best_session(&bob, &alice));
    assert_eq!(alice.queue.queue_size(), 0);
    assert_eq!(bob.queue.queue_size(), 0);
    assert!(alice.processor.has_peer_used_forward_security(&bob.identity));
    assert!(bob.processor.has_peer_used_forward_security(&alice.identity));
}

#[test]
fn concurrent_senders_share_one_session() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let (alice, bob) = peers(11);
    let alice = Arc::new(alice);
    let bob_identity = bob.identity;

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let alice = Arc::clone(&alice);
            thread::spawn(move || {
                let mut actions = Vec::new();
                for n in 0..PER_THREAD {
                    let message = Message::new(
                        alice.identity,
                        bob_identity,
                        MessageId::new((thread_index * PER_THREAD + n) as u64 + 1),
                        0,
                        MessageBody::Text(format!("{thread_index}-{n}")),
                    );
                    actions.extend(alice.processor.send(message).unwrap());
                }
                actions
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let initiated = all
        .iter()
        .filter(|action| matches!(action, FsAction::Event(FsEvent::SessionInitiated { .. })))
        .count();
    assert_eq!(initiated, 1);

    // The relay delivers the Init first and data in counter order.
    let mut sent = boxes(&all);
    sent.sort_by_key(|message_box| message_box.session.map(|header| header.counter));
    assert!(sent[0].session.is_none());

    let mut delivered = 0;
    for message_box in &sent {
        delivered += texts(&bob.processor.receive(message_box).unwrap()).len();
    }
    assert_eq!(delivered, THREADS * PER_THREAD);

    let counters: Vec<u64> = sent.iter().filter_map(|b| b.session).map(|h| h.counter).collect();
    let expected: Vec<u64> = (1..=(THREADS * PER_THREAD) as u64).collect();
    assert_eq!(counters, expected, "every counter used exactly once");
}

#[test]
fn restart_with_restored_queue_resends_pending() {
    let (mut alice, bob) = peers(13);
    let message = alice.text(bob.identity, "survives restart");
    alice.processor.send(message).unwrap();

    let restored = MessageQueue::restore(&alice.queue.snapshot().unwrap()).unwrap();
    assert_eq!(restored.queue_size(), 2);

    let mut delivered = Vec::new();
    for entry in restored.pending() {
        delivered.extend(texts(&bob.processor.receive(&entry.message).unwrap()));
    }
    assert_eq!(delivered, vec!["survives restart".to_string()]);
}

#[test]
fn replay_after_delivery_is_an_error() {
    let (mut alice, bob) = peers(17);
    let message = alice.text(bob.identity, "once");
    let sent = alice.processor.send(message).unwrap();

    relay(&alice, &bob, &sent);
    for message_box in boxes(&sent) {
        assert!(matches!(
            bob.processor.receive(&message_box),
            Err(ProcessorError::Replay { .. })
        ));
    }
}

#[test]
fn concurrent_copies_of_one_box_are_handled_once() {
    const THREADS: usize = 8;

    let (mut alice, bob) = peers(19);
    let message = alice.text(bob.identity, "setup");
    let setup = alice.processor.send(message).unwrap();
    let replies = relay(&alice, &bob, &setup);
    relay(&bob, &alice, &replies);

    let message = alice.text(bob.identity, "exactly once");
    let message_box = boxes(&alice.processor.send(message).unwrap()).remove(0);
    assert!(message_box.session.is_some());

    let bob = Arc::new(bob);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let bob = Arc::clone(&bob);
            let barrier = Arc::clone(&barrier);
            let message_box = message_box.clone();
            thread::spawn(move || {
                barrier.wait();
                bob.processor.receive(&message_box)
            })
        })
        .collect();

    let mut delivered = Vec::new();
    let mut replays = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(actions) => delivered.extend(texts(&actions)),
            Err(ProcessorError::Replay { .. }) => replays += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(delivered, vec!["exactly once".to_string()]);
    assert_eq!(replays, THREADS - 1);
    assert_eq!(bob.sessions.session_count(&alice.identity), 1, "no spurious reject");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_reordered_delivery_never_duplicates(
        seed in any::<u64>(),
        order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (mut alice, bob) = peers(seed);

        // Complete the handshake first so every data box is 4-DH.
        let message = alice.text(bob.identity, "setup");
        let sent = alice.processor.send(message).unwrap();
        let replies = relay(&alice, &bob, &sent);
        relay(&bob, &alice, &replies);

        let mut outgoing = Vec::new();
        for n in 0..12 {
            let message = alice.text(bob.identity, &format!("m{n}"));
            outgoing.extend(boxes(&alice.processor.send(message).unwrap()));
        }
        prop_assert!(outgoing.iter().all(|b| b.session.map(|h| h.dh_type) == Some(DhType::FourDh)));

        let mut delivered = Vec::new();
        let mut out_of_order = 0;
        for index in order {
            let actions = bob.processor.receive(&outgoing[index]).unwrap();
            out_of_order += actions
                .iter()
                .filter(|a| matches!(a, FsAction::Event(FsEvent::MessageOutOfOrder { .. })))
                .count();
            delivered.extend(texts(&actions));
        }

        let mut unique = delivered.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), delivered.len());
        prop_assert_eq!(delivered.len() + out_of_order, 12);
        prop_assert_eq!(bob.sessions.session_count(&alice.identity), 1);
    }
}
