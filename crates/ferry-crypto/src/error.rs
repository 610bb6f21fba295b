//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid public key (wrong encoding or low-order point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// KEM ciphertext has the wrong length or encoding
    #[error("invalid KEM ciphertext: expected {expected} bytes, got {actual}")]
    InvalidCiphertext {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid state for operation
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Message counter exhausted, the session must be re-established
    #[error("message counter exhausted")]
    CounterOverflow,

    /// A message number that was already consumed arrived again
    #[error("replay detected: message {message_number} already consumed")]
    ReplayDetected {
        /// Offending message number
        message_number: u32,
    },

    /// Out-of-order gap larger than the skip bound
    #[error("skip limit exceeded: gap of {gap} messages, limit {max_skip}")]
    SkipLimitExceeded {
        /// Number of keys that would have to be skipped
        gap: u64,
        /// Configured bound
        max_skip: u32,
    },

    /// Message belongs to an epoch the receiver has not reached yet
    #[error("epoch {epoch} not reached (current {current})")]
    EpochNotReached {
        /// Epoch carried by the message
        epoch: u64,
        /// Receiver's current epoch
        current: u64,
    },

    /// Message belongs to an epoch whose key has already been wiped
    #[error("epoch {epoch} expired (current {current})")]
    EpochExpired {
        /// Epoch carried by the message
        epoch: u64,
        /// Receiver's current epoch
        current: u64,
    },

    /// Too many future epoch ciphertexts buffered
    #[error("epoch desynchronization: {pending} future epochs pending, limit {limit}")]
    EpochDesync {
        /// Number of buffered future epochs
        pending: usize,
        /// Configured bound
        limit: usize,
    },

    /// Session was closed or torn down after a fatal error
    #[error("session terminated")]
    SessionTerminated,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl CryptoError {
    /// Whether the error tears the session down.
    ///
    /// Skip-bound and epoch desynchronization are treated as possible
    /// attacks; the ratchet state is wiped rather than truncated.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SkipLimitExceeded { .. }
                | Self::EpochDesync { .. }
                | Self::EpochExpired { .. }
                | Self::CounterOverflow
                | Self::SessionTerminated
        )
    }

    /// Errors that only arise while agreeing on keys.
    #[must_use]
    pub fn is_key_exchange(&self) -> bool {
        matches!(
            self,
            Self::InvalidKeyLength { .. }
                | Self::InvalidPublicKey
                | Self::InvalidCiphertext { .. }
                | Self::InvalidSignature
        )
    }

    /// Errors that indicate the two ratchets disagree, or that someone is
    /// replaying or forging traffic.
    #[must_use]
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. }
                | Self::SkipLimitExceeded { .. }
                | Self::EpochExpired { .. }
                | Self::EpochDesync { .. }
                | Self::DecryptionFailed
        )
    }
}
