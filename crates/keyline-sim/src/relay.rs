//! In-process relay standing in for the message server.
//!
//! Boxes handed to [`LoopbackRelay::send`] wait in a FIFO until the
//! simulation pumps them to their recipient. The relay can go offline
//! (sends fail and stay in the sender's queue) and can drop every n-th
//! session box to provoke ratchet skips.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use keyline_core::{MessageBox, Transport};
use thiserror::Error;

/// Errors from handing a box to the relay.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// The relay is not reachable
    #[error("relay offline")]
    Offline,
}

/// Lossy FIFO relay between simulated parties.
pub struct LoopbackRelay {
    in_flight: Mutex<VecDeque<MessageBox>>,
    online: AtomicBool,
    drop_every: Option<usize>,
    session_boxes: AtomicUsize,
    dropped: AtomicUsize,
    delivered: Mutex<Vec<MessageBox>>,
}

impl LoopbackRelay {
    /// Create an online relay. With `drop_every = Some(n)`, every n-th
    /// session box is silently lost.
    pub fn new(drop_every: Option<usize>) -> Self {
        Self {
            in_flight: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(true),
            drop_every: drop_every.filter(|n| *n > 0),
            session_boxes: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Take the relay offline or bring it back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!(online, "relay connectivity changed");
    }

    /// Next box to deliver, oldest first.
    pub fn next_box(&self) -> Option<MessageBox> {
        let message_box = self.in_flight.lock().expect("relay mutex poisoned").pop_front()?;
        self.delivered.lock().expect("relay mutex poisoned").push(message_box.clone());
        Some(message_box)
    }

    /// Copy of a box the relay has already delivered, for replay.
    pub fn delivered_session_box(&self) -> Option<MessageBox> {
        self.delivered
            .lock()
            .expect("relay mutex poisoned")
            .iter()
            .find(|message_box| message_box.session.is_some())
            .cloned()
    }

    /// Number of boxes lost on purpose.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn should_drop(&self, message_box: &MessageBox) -> bool {
        let Some(every) = self.drop_every else {
            return false;
        };
        if message_box.session.is_none() {
            return false;
        }
        let seen = self.session_boxes.fetch_add(1, Ordering::SeqCst) + 1;
        seen % every == 0
    }
}

impl Transport for LoopbackRelay {
    type Error = RelayError;

    fn send(&self, message_box: &MessageBox) -> Result<(), Self::Error> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RelayError::Offline);
        }

        if self.should_drop(message_box) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(message_id = %message_box.message_id, to = %message_box.to, "relay dropped box");
            return Ok(());
        }

        self.in_flight.lock().expect("relay mutex poisoned").push_back(message_box.clone());
        Ok(())
    }
}
