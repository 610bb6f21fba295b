//! Transport error types.

use crate::channel::ChannelId;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport (or the channel set) was closed locally
    #[error("transport is closed")]
    Closed,

    /// A single channel closed underneath us
    #[error("channel {0} closed")]
    ChannelClosed(ChannelId),

    /// Every channel of the connection has failed
    #[error("all {0} channels failed")]
    AllChannelsFailed(usize),

    /// No channel drained or no acknowledgement arrived within the retry budget
    #[error("send timed out after {attempts} attempts")]
    SendTimeout {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed frame from the peer
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Whether retrying on the same connection could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::SendTimeout { .. })
    }
}

/// Frame encoding and decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input shorter than the fixed header
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Unknown frame type byte
    #[error("invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    /// Declared payload length exceeds the buffer
    #[error("payload length exceeds frame")]
    PayloadOverflow,

    /// Payload above the protocol maximum
    #[error("payload of {0} bytes exceeds maximum")]
    PayloadTooLarge(usize),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
