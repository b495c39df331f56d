//! Keyline simulator binary.
//!
//! Runs two parties in one process and lets them talk through a lossy
//! loopback relay: session handshake, ratcheting, acknowledgements, a relay
//! outage with queue flush, replay rejection, a session refresh and
//! termination.
//!
//! # Usage
//!
//! ```bash
//! # Ten rounds, deterministic keys
//! keyline-sim --seed 7
//!
//! # Lose every third session box, watch the ratchet skip
//! RUST_LOG=keyline_core=debug keyline-sim --rounds 20 --drop-every 3
//! ```

mod relay;

use std::{cell::Cell, sync::Arc};

use clap::Parser;
use keyline_core::{
    Config, Contact, Environment, ForwardSecurityProcessor, FsAction, Identity, IdentityError,
    IdentityStore, LocalIdentity, MemoryContactDirectory, MemoryNonceStore, MemorySessionStore,
    Message, MessageBody, MessageId, MessageQueue, ProcessorError, QueueMessageId, SeededEnv,
    TerminateCause, Transport, VersionRange,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::relay::LoopbackRelay;

/// Keyline forward-secrecy simulator
#[derive(Parser, Debug)]
#[command(name = "keyline-sim")]
#[command(about = "Simulate two keyline parties over a loopback relay")]
#[command(version)]
struct Args {
    /// Seed for keys, nonces and message ids
    #[arg(short, long, default_value = "0")]
    seed: u64,

    /// Conversation rounds (one message each way per round)
    #[arg(short, long, default_value = "10")]
    rounds: usize,

    /// Drop every n-th session box in the relay
    #[arg(long)]
    drop_every: Option<usize>,

    /// Take the relay offline for one round in the middle of the run
    #[arg(long)]
    outage: bool,

    /// Lowest protocol version to offer
    #[arg(long, default_value = "1")]
    min_version: u8,

    /// Highest protocol version to offer
    #[arg(long, default_value = "2")]
    max_version: u8,

    /// Minimum padded plaintext length
    #[arg(long, default_value = "32")]
    min_padded_len: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

type Processor = ForwardSecurityProcessor<MemoryNonceStore, MemorySessionStore, SeededEnv>;

/// One simulated user.
struct Party {
    identity: Identity,
    processor: Processor,
    queue: MessageQueue,
    env: SeededEnv,
    delivered: Cell<usize>,
}

impl Party {
    fn new(
        name: &str,
        nickname: &str,
        seed: u64,
        contacts: &MemoryContactDirectory,
        config: Config,
    ) -> Result<Self, IdentityError> {
        let env = SeededEnv::new(seed);
        let local = LocalIdentity::generate(Identity::new(name)?, &env).with_nickname(nickname);
        contacts.add(Contact { identity: local.identity(), public_key: local.public_key() });

        let queue = MessageQueue::new();
        let processor = ForwardSecurityProcessor::new(
            Arc::new(local.clone()),
            Arc::new(contacts.clone()),
            MemorySessionStore::new(),
            MemoryNonceStore::new(),
            queue.clone(),
            env.clone(),
            config,
        );

        Ok(Self { identity: local.identity(), processor, queue, env, delivered: Cell::new(0) })
    }

    fn text(&self, to: Identity, text: String) -> Message {
        self.env.advance_millis(1_000);
        Message::new(
            self.identity,
            to,
            MessageId::random(&self.env),
            self.env.wall_clock_millis(),
            MessageBody::Text(text),
        )
    }

    /// Carry out processor actions: hand boxes to the relay, count
    /// deliveries, log events.
    fn dispatch(&self, actions: Vec<FsAction>, relay: &LoopbackRelay) {
        for action in actions {
            match action {
                FsAction::Send(message_box) => {
                    if let Err(err) = relay.send(&message_box) {
                        tracing::warn!(
                            party = %self.identity,
                            message_id = %message_box.message_id,
                            %err,
                            "send failed, box stays queued"
                        );
                    }
                },
                FsAction::Deliver(message) => {
                    self.delivered.set(self.delivered.get() + 1);
                    tracing::info!(
                        party = %self.identity,
                        from = %message.from,
                        nickname = message.nickname.as_deref().unwrap_or(""),
                        body = ?message.body,
                        "delivered"
                    );
                },
                FsAction::Event(event) => {
                    tracing::info!(party = %self.identity, ?event, "session event");
                },
            }
        }
    }
}

/// Deliver everything in flight, including replies produced on the way.
fn pump(relay: &LoopbackRelay, parties: [&Party; 2]) {
    while let Some(message_box) = relay.next_box() {
        let Some(recipient) = parties.iter().find(|party| party.identity == message_box.to) else {
            tracing::warn!(to = %message_box.to, "box for unknown party");
            continue;
        };

        match recipient.processor.receive(&message_box) {
            Ok(actions) => {
                // The server acks once the recipient has taken the box.
                if let Some(sender) = parties.iter().find(|party| party.identity == message_box.from) {
                    sender.queue.process_ack(&QueueMessageId::of(&message_box));
                }
                recipient.dispatch(actions, relay);
            },
            Err(err) => {
                tracing::warn!(party = %recipient.identity, %err, "receive failed");
            },
        }
    }
}

fn send(party: &Party, to: &Party, text: String, relay: &LoopbackRelay) -> Result<(), ProcessorError> {
    let actions = party.processor.send(party.text(to.identity, text))?;
    party.dispatch(actions, relay);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = Config {
        versions: VersionRange::new(args.min_version, args.max_version)?,
        min_padded_len: args.min_padded_len,
    }
    .normalized();

    tracing::info!(seed = args.seed, rounds = args.rounds, versions = %config.versions, "keyline simulator starting");

    let contacts = MemoryContactDirectory::new();
    let alice = Party::new("ALICE001", "Alice", args.seed, &contacts, config)?;
    let bob = Party::new("BOB00001", "Bob", args.seed.wrapping_add(1), &contacts, config)?;
    let relay = LoopbackRelay::new(args.drop_every);

    let outage_round = args.outage.then_some(args.rounds / 2);
    for round in 0..args.rounds {
        if outage_round == Some(round) {
            relay.set_online(false);
        }

        send(&alice, &bob, format!("hello #{round} from alice"), &relay)?;

        if outage_round == Some(round) {
            relay.set_online(true);
            let flushed = alice.queue.flush(&relay)?;
            tracing::info!(flushed, "reconnected, flushed pending boxes");
        }
        pump(&relay, [&alice, &bob]);

        send(&bob, &alice, format!("reply #{round} from bob"), &relay)?;
        pump(&relay, [&alice, &bob]);
    }

    // Boxes the relay lost are still queued; resend them like a reconnect
    // would. The ratchet has moved on, so they arrive out of order.
    for party in [&alice, &bob] {
        let flushed = party.queue.flush(&relay)?;
        if flushed > 0 {
            tracing::info!(party = %party.identity, flushed, "resent unacknowledged boxes");
        }
    }
    pump(&relay, [&alice, &bob]);

    if let Some(replayed) = relay.delivered_session_box() {
        match bob.processor.receive(&replayed) {
            Err(ProcessorError::Replay { message_id, .. }) => {
                tracing::info!(%message_id, "replayed box rejected");
            },
            other => tracing::error!(?other, "replayed box was not rejected"),
        }
    }

    let actions = bob.processor.refresh(&alice.identity)?;
    bob.dispatch(actions, &relay);
    pump(&relay, [&alice, &bob]);

    let actions = alice.processor.terminate(&bob.identity, TerminateCause::DisabledByLocal)?;
    alice.dispatch(actions, &relay);
    pump(&relay, [&alice, &bob]);

    tracing::info!(
        alice_delivered = alice.delivered.get(),
        bob_delivered = bob.delivered.get(),
        dropped = relay.dropped(),
        alice_queued = alice.queue.queue_size(),
        bob_queued = bob.queue.queue_size(),
        "simulation finished"
    );

    Ok(())
}
