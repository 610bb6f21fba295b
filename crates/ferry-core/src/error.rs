//! Error types for the transfer engine.
//!
//! Errors follow the engine's failure taxonomy:
//!
//! - **KeyExchange**: malformed, mismatched or unsigned handshake material
//! - **RatchetDesync**: skip bound exceeded, replay, epoch desynchronization
//! - **Transport**: channel failure or send timeout after bounded retries
//! - **Validation**: bad input rejected before any key material is touched
//!
//! Everything except `Validation` is fatal to the recipient session it
//! occurs in and nothing else. A group transfer reports such errors per
//! recipient instead of returning them.

use ferry_crypto::CryptoError;
use ferry_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in transfer operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FerryError {
    /// Handshake failed or was rejected
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Ratchet state diverged from the peer's
    #[error("ratchet desynchronized: {0}")]
    RatchetDesync(CryptoError),

    /// Cryptographic failure not attributable to the handshake or desync
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Transport failure after bounded retries
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Input rejected before any cryptographic state was touched
    #[error("validation failed: {0}")]
    Validation(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Received file does not match the manifest
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Cancelled locally or by the peer
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// The session's keys are gone
    #[error("session terminated")]
    SessionTerminated,

    /// A protocol step did not complete in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Peer sent something that does not fit the protocol state
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Wire encoding failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FerryError {
    /// Whether this error ends the recipient session it occurred in.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Whether this error may indicate tampering and deserves a warning.
    #[must_use]
    pub fn is_attack_indicator(&self) -> bool {
        matches!(
            self,
            Self::RatchetDesync(_) | Self::Integrity(_) | Self::KeyExchange(_)
        )
    }

    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<CryptoError> for FerryError {
    fn from(err: CryptoError) -> Self {
        if err == CryptoError::SessionTerminated {
            Self::SessionTerminated
        } else if err.is_key_exchange() {
            Self::KeyExchange(err.to_string())
        } else if err.is_desync() {
            Self::RatchetDesync(err)
        } else {
            Self::Crypto(err)
        }
    }
}

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<bincode::Error> for FerryError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_classification() {
        assert_eq!(
            FerryError::from(CryptoError::SessionTerminated),
            FerryError::SessionTerminated
        );
        assert!(matches!(
            FerryError::from(CryptoError::InvalidPublicKey),
            FerryError::KeyExchange(_)
        ));
        assert!(matches!(
            FerryError::from(CryptoError::SkipLimitExceeded {
                gap: 2000,
                max_skip: 1000
            }),
            FerryError::RatchetDesync(_)
        ));
        assert!(matches!(
            FerryError::from(CryptoError::ReplayDetected { message_number: 3 }),
            FerryError::RatchetDesync(_)
        ));
        assert!(matches!(
            FerryError::from(CryptoError::RandomFailed),
            FerryError::Crypto(_)
        ));
    }

    #[test]
    fn test_validation_is_not_fatal() {
        assert!(!FerryError::validation("empty file").is_fatal_to_session());
        assert!(FerryError::Transport(TransportError::Closed).is_fatal_to_session());
        assert!(FerryError::SessionTerminated.is_fatal_to_session());
    }

    #[test]
    fn test_attack_indicators() {
        let desync = FerryError::from(CryptoError::ReplayDetected { message_number: 1 });
        assert!(desync.is_attack_indicator());
        assert!(FerryError::Integrity("hash mismatch".into()).is_attack_indicator());
        assert!(!FerryError::Timeout("receipt").is_attack_indicator());
        assert!(!FerryError::Transport(TransportError::Closed).is_attack_indicator());
    }
}
