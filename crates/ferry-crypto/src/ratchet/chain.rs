//! Symmetric chain and root-key derivations shared by both ratchets.

use crate::hash::hkdf;
use crate::wipe::{Secret, secure_wipe};
use zeroize::Zeroize;

const ROOT_INFO: &[u8] = b"ferry.double-ratchet.root.v1";
const CHAIN_NEXT: &str = "ferry.double-ratchet.chain-next.v1";
const CHAIN_MESSAGE: &str = "ferry.double-ratchet.message-key.v1";

/// Chain key for symmetric ratcheting
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Ratchet forward one step and return the message key for the step.
    ///
    /// The previous chain value is overwritten; neither it nor the message
    /// key can be recomputed from the new chain value.
    pub fn ratchet(&mut self) -> MessageKey {
        let message = blake3::derive_key(CHAIN_MESSAGE, &self.0);
        let mut next = blake3::derive_key(CHAIN_NEXT, &self.0);
        self.0.copy_from_slice(&next);
        next.zeroize();
        MessageKey(message)
    }
}

/// One-time key for a single message.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Root KDF: mix a DH output into the root key, yielding the next root and
/// a fresh chain key.
pub(crate) fn kdf_root(root: &Secret<32>, dh_output: &[u8; 32]) -> (Secret<32>, ChainKey) {
    let mut out = [0u8; 64];
    hkdf(root.expose(), dh_output, ROOT_INFO, &mut out);

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&out[..32]);
    chain.copy_from_slice(&out[32..]);
    secure_wipe(&mut out);

    let result = (Secret::new(next_root), ChainKey(chain));
    next_root.zeroize();
    chain.zeroize();
    result
}
