//! Multi-pass secure wiping of secret material.
//!
//! Ratchet roots, chain keys and ephemeral secrets are overwritten in three
//! passes before release: all-ones, random bytes, then zeros. Compiler fences
//! between passes keep the intermediate stores from being elided.

use crate::random::fill_random;
use std::fmt;
use std::sync::atomic::{Ordering, compiler_fence};
use zeroize::Zeroize;

/// Overwrite `buf` with 0xFF, then random bytes, then zeros.
///
/// The random pass falls back to a fixed pattern if the OS CSPRNG is
/// unavailable; the final zero pass always runs.
pub fn secure_wipe(buf: &mut [u8]) {
    buf.fill(0xFF);
    compiler_fence(Ordering::SeqCst);

    if fill_random(buf).is_err() {
        buf.fill(0xAA);
    }
    compiler_fence(Ordering::SeqCst);

    buf.zeroize();
    compiler_fence(Ordering::SeqCst);
}

/// Fixed-size secret that is securely wiped on drop.
///
/// `Debug` never prints the contents.
#[derive(Clone)]
pub struct Secret<const N: usize>([u8; N]);

impl<const N: usize> Secret<N> {
    /// Wrap raw secret bytes.
    #[must_use]
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8; N] {
        &self.0
    }

    /// Wipe the contents now, leaving an all-zero secret.
    pub fn wipe(&mut self) {
        secure_wipe(&mut self.0);
    }

    /// Whether the secret has been wiped (or was never set).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl<const N: usize> Drop for Secret<N> {
    fn drop(&mut self) {
        secure_wipe(&mut self.0);
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>([REDACTED])")
    }
}

/// Heap buffer holding secret bytes of variable length, wiped on drop.
pub struct SecretVec(Vec<u8>);

impl SecretVec {
    /// Take ownership of secret bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl Clone for SecretVec {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Drop for SecretVec {
    fn drop(&mut self) {
        secure_wipe(&mut self.0);
    }
}

impl fmt::Debug for SecretVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretVec(len={}, [REDACTED])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_wipe_zeroes_buffer() {
        let mut buf = [0x5Au8; 64];
        secure_wipe(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_secret_wipe_in_place() {
        let mut secret = Secret::new([7u8; 32]);
        assert!(!secret.is_zero());
        secret.wipe();
        assert!(secret.is_zero());
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = Secret::new([0x41u8; 32]);
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("65"));

        let vec = SecretVec::new(vec![1, 2, 3]);
        assert_eq!(format!("{vec:?}"), "SecretVec(len=3, [REDACTED])");
    }
}
