//! Outbound transport seam.
//!
//! The session layer never performs I/O itself. Callers hand encoded boxes
//! to a [`Transport`] and feed server acknowledgements back into
//! [`MessageQueue::process_ack`](crate::queue::MessageQueue::process_ack).

use crate::coder::MessageBox;

/// Sends encoded message boxes.
pub trait Transport {
    /// Transport failure.
    type Error: std::error::Error;

    /// Hand one box to the network.
    fn send(&self, message: &MessageBox) -> Result<(), Self::Error>;
}
