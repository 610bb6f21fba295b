//! ML-KEM-768 key encapsulation.
//!
//! Thin owned wrappers over `pqcrypto-mlkem` that validate lengths on every
//! import and keep secret keys in wiped buffers. Serves both the one-shot
//! hybrid handshake and the per-epoch encapsulations of the sparse ratchet.

use crate::CryptoError;
use crate::wipe::{Secret, SecretVec};
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use std::fmt;
use std::sync::atomic::{Ordering, compiler_fence};

/// ML-KEM-768 public key size.
pub const KEM_PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 secret key size.
pub const KEM_SECRET_KEY_SIZE: usize = 2400;

/// ML-KEM-768 ciphertext size.
pub const KEM_CIPHERTEXT_SIZE: usize = 1088;

/// ML-KEM-768 shared secret size.
pub const KEM_SHARED_SECRET_SIZE: usize = 32;

/// Encapsulation key, safe to publish.
#[derive(Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

/// Encapsulated secret as sent on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct KemCiphertext(Vec<u8>);

/// Decapsulated (or encapsulated) 32-byte secret.
pub struct KemSharedSecret(Secret<KEM_SHARED_SECRET_SIZE>);

/// ML-KEM-768 keypair. The secret half is securely wiped on drop.
#[derive(Clone)]
pub struct KemKeypair {
    public: KemPublicKey,
    secret: SecretVec,
}

impl KemKeypair {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let (pk, mut sk) = mlkem768::keypair();
        let keypair = Self {
            public: KemPublicKey(pk.as_bytes().to_vec()),
            secret: SecretVec::new(sk.as_bytes().to_vec()),
        };
        scrub_secret_key(&mut sk);
        keypair
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> &KemPublicKey {
        &self.public
    }

    /// Recover the shared secret from a ciphertext.
    ///
    /// ML-KEM uses implicit rejection: a well-formed but forged ciphertext
    /// yields an unrelated secret rather than an error, so callers must
    /// authenticate whatever the secret keys.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the stored secret key is
    /// corrupt.
    pub fn decapsulate(&self, ciphertext: &KemCiphertext) -> Result<KemSharedSecret, CryptoError> {
        let mut sk = mlkem768::SecretKey::from_bytes(self.secret.expose()).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEM_SECRET_KEY_SIZE,
                actual: self.secret.expose().len(),
            }
        })?;
        let ct = mlkem768::Ciphertext::from_bytes(&ciphertext.0).map_err(|_| {
            CryptoError::InvalidCiphertext {
                expected: KEM_CIPHERTEXT_SIZE,
                actual: ciphertext.0.len(),
            }
        })?;
        let mut ss = mlkem768::decapsulate(&ct, &sk);
        scrub_secret_key(&mut sk);
        let secret = KemSharedSecret::from_slice(ss.as_bytes());
        scrub_shared_secret(&mut ss);
        Ok(secret)
    }
}

impl fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KemPublicKey {
    /// Import from untrusted bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a wrong-length key and
    /// [`CryptoError::InvalidPublicKey`] if the encoding is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEM_PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        mlkem768::PublicKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes.to_vec()))
    }

    /// Raw encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encapsulate a fresh secret to this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the key fails to parse.
    pub fn encapsulate(&self) -> Result<(KemSharedSecret, KemCiphertext), CryptoError> {
        let pk =
            mlkem768::PublicKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let (mut ss, ct) = mlkem768::encapsulate(&pk);
        let secret = KemSharedSecret::from_slice(ss.as_bytes());
        scrub_shared_secret(&mut ss);
        Ok((secret, KemCiphertext(ct.as_bytes().to_vec())))
    }
}

impl fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KemPublicKey({}..)", hex::encode(&self.0[..8.min(self.0.len())]))
    }
}

impl KemCiphertext {
    /// Import from untrusted bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCiphertext`] on a wrong-length input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_CIPHERTEXT_SIZE {
            return Err(CryptoError::InvalidCiphertext {
                expected: KEM_CIPHERTEXT_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Raw encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KemCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KemCiphertext({} bytes)", self.0.len())
    }
}

impl KemSharedSecret {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; KEM_SHARED_SECRET_SIZE];
        let n = bytes.len().min(KEM_SHARED_SECRET_SIZE);
        out[..n].copy_from_slice(&bytes[..n]);
        let secret = Secret::new(out);
        crate::wipe::secure_wipe(&mut out);
        Self(secret)
    }

    /// Borrow the secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEM_SHARED_SECRET_SIZE] {
        self.0.expose()
    }
}

/// Overwrite a library value in place.
///
/// `pqcrypto` keys and secrets are plain `Copy` arrays without `Zeroize`,
/// so the only handle on their storage is the variable itself.
fn scrub<T: Copy>(slot: &mut T, zero: T) {
    // SAFETY: `slot` is an exclusive borrow of a live `T` and `zero` is a
    // valid `T`; a volatile write of it cannot be elided.
    unsafe { std::ptr::write_volatile(slot, zero) };
    compiler_fence(Ordering::SeqCst);
}

fn scrub_secret_key(sk: &mut mlkem768::SecretKey) {
    if let Ok(zero) = mlkem768::SecretKey::from_bytes(&[0u8; KEM_SECRET_KEY_SIZE]) {
        scrub(sk, zero);
    }
}

fn scrub_shared_secret(ss: &mut mlkem768::SharedSecret) {
    if let Ok(zero) = mlkem768::SharedSecret::from_bytes(&[0u8; KEM_SHARED_SECRET_SIZE]) {
        scrub(ss, zero);
    }
}
