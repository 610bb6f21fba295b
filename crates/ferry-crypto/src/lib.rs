//! # Ferry Crypto
//!
//! Cryptographic core for the Ferry transfer engine.
//!
//! This crate provides:
//! - Hybrid post-quantum key agreement (ML-KEM-768 + X25519, combined through HKDF)
//! - A Double Ratchet for per-message forward secrecy and break-in recovery
//! - A sparse post-quantum epoch ratchet that re-injects KEM secrets periodically
//! - The composite "triple ratchet" session that binds both into one encrypt/decrypt API
//! - Ed25519 identity keys for authenticating handshakes and group invites
//! - Multi-pass secure wiping of secret material
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Post-quantum KEM | ML-KEM-768 | NIST level 3 |
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//!
//! ## Key Schedule
//!
//! ```text
//!   ML-KEM ss ──┐
//!               ├─ HKDF(transcript) ─► hybrid secret ─┬─► double ratchet root
//!   X25519 ss ──┘                                     └─► epoch roots (one per direction)
//!
//!   message key = KDF(double ratchet message key ‖ current epoch key)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod hybrid;
pub mod identity;
pub mod kem;
pub mod random;
pub mod ratchet;
pub mod wipe;
pub mod x25519;

pub use error::CryptoError;
pub use hybrid::{HybridInitiator, HybridSecret, KeyExchangeOffer, KeyExchangeResponse};
pub use ratchet::{
    RatchetConfig, RatchetMessage, Role, SessionParameters, SessionState, TripleRatchetSession,
};

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
