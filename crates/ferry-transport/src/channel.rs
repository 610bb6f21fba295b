//! Channel abstraction over the substrate.
//!
//! A channel is unordered, unreliable and message-oriented. It exposes
//! how many bytes it has accepted but not yet put on the wire, which is
//! what backpressure is driven by.

use crate::error::TransportResult;
use async_trait::async_trait;

/// Index of a channel within one peer connection
pub type ChannelId = usize;

/// Counters kept by a channel implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages accepted by `send`
    pub messages_sent: u64,
    /// Bytes accepted by `send`
    pub bytes_sent: u64,
    /// Messages handed to the far end
    pub messages_delivered: u64,
    /// Messages dropped by the link
    pub messages_dropped: u64,
}

/// One unordered, unreliable, message-oriented channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Position of this channel within its connection.
    fn id(&self) -> ChannelId;

    /// Queue one message.
    ///
    /// Acceptance says nothing about delivery; the message may be lost
    /// or reordered relative to messages on other channels.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`](crate::TransportError::ChannelClosed)
    /// once the channel has closed.
    async fn send(&self, message: &[u8]) -> TransportResult<()>;

    /// Bytes accepted but not yet transmitted.
    fn buffered_amount(&self) -> usize;

    /// Close the channel. Idempotent.
    fn close(&self);

    /// Whether the channel is closed.
    fn is_closed(&self) -> bool;

    /// Channel counters.
    fn stats(&self) -> ChannelStats {
        ChannelStats::default()
    }
}
