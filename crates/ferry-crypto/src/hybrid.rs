//! Hybrid post-quantum key agreement.
//!
//! One ML-KEM-768 encapsulation and one X25519 exchange are combined through
//! HKDF, salted with a hash of the full handshake transcript, so the session
//! secret stays safe while either primitive holds.
//!
//! ```text
//! Initiator                                   Responder
//!   initiate()
//!     ── KeyExchangeOffer { kem_pk, dh_pk } ──►
//!                                               respond(offer)
//!     ◄── KeyExchangeResponse { kem_ct, dh_pk } ──
//!   complete(response)
//! ```
//!
//! Each side generates exactly one ephemeral KEM keypair (initiator only) and
//! one ephemeral X25519 key, and wipes them as soon as the secret is derived.

use crate::CryptoError;
use crate::hash::{IncrementalHasher, hkdf};
use crate::kem::{KemCiphertext, KemKeypair, KemPublicKey};
use crate::wipe::{Secret, secure_wipe};
use crate::x25519;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Versioned HKDF context for the combined secret.
pub const HYBRID_KX_CONTEXT: &[u8] = b"ferry.hybrid-kx.v1";

/// Initiator's ephemeral public keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeOffer {
    /// ML-KEM-768 encapsulation key
    pub kem_public: Vec<u8>,
    /// X25519 public key
    pub dh_public: [u8; 32],
}

/// Responder's reply: KEM ciphertext plus its own ephemeral DH key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    /// ML-KEM-768 ciphertext encapsulated to the offer's key
    pub kem_ciphertext: Vec<u8>,
    /// X25519 public key
    pub dh_public: [u8; 32],
}

/// 32-byte session secret agreed by the handshake.
pub struct HybridSecret(Secret<32>);

impl HybridSecret {
    /// Borrow the secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.expose()
    }

    /// Short public identifier for logs, derived one-way from the secret.
    #[must_use]
    pub fn session_id(&self) -> [u8; 16] {
        let digest =
            crate::hash::Kdf::new("ferry.hybrid-kx.session-id.v1").derive_key(self.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        id
    }
}

impl fmt::Debug for HybridSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridSecret([REDACTED])")
    }
}

/// In-progress handshake on the initiating side.
///
/// Holds the ephemeral secrets until [`HybridInitiator::complete`] consumes
/// them; dropping it without completing wipes them as well.
pub struct HybridInitiator {
    kem: KemKeypair,
    dh: x25519::PrivateKey,
    offer: KeyExchangeOffer,
}

impl HybridInitiator {
    /// Generate the ephemeral keypairs and the offer to send.
    #[must_use]
    pub fn initiate() -> (Self, KeyExchangeOffer) {
        let kem = KemKeypair::generate();
        let dh = x25519::PrivateKey::generate();
        let offer = KeyExchangeOffer {
            kem_public: kem.public_key().as_bytes().to_vec(),
            dh_public: dh.public_key().to_bytes(),
        };
        (
            Self {
                kem,
                dh,
                offer: offer.clone(),
            },
            offer,
        )
    }

    /// The offer this initiator sent.
    #[must_use]
    pub fn offer(&self) -> &KeyExchangeOffer {
        &self.offer
    }

    /// Finish the handshake with the responder's reply.
    ///
    /// # Errors
    ///
    /// Fails on a wrong-length ciphertext or a low-order DH key. The
    /// ephemeral secrets are wiped either way.
    pub fn complete(self, response: &KeyExchangeResponse) -> Result<HybridSecret, CryptoError> {
        let ciphertext = KemCiphertext::from_bytes(&response.kem_ciphertext)?;
        let peer_dh = x25519::PublicKey::from_bytes(response.dh_public);

        let kem_ss = self.kem.decapsulate(&ciphertext)?;
        let dh_ss = self.dh.exchange(&peer_dh)?;

        Ok(combine(
            kem_ss.as_bytes(),
            dh_ss.as_bytes(),
            &self.offer,
            response,
        ))
    }
}

/// Answer an offer, producing the shared secret and the reply to send back.
///
/// # Errors
///
/// Malformed or wrong-length public keys fail before any secret is derived.
pub fn respond(
    offer: &KeyExchangeOffer,
) -> Result<(HybridSecret, KeyExchangeResponse), CryptoError> {
    let peer_kem = KemPublicKey::from_bytes(&offer.kem_public)?;
    let peer_dh = x25519::PublicKey::from_bytes(offer.dh_public);

    let dh = x25519::PrivateKey::generate();
    let dh_ss = dh.exchange(&peer_dh)?;
    let (kem_ss, ciphertext) = peer_kem.encapsulate()?;

    let response = KeyExchangeResponse {
        kem_ciphertext: ciphertext.as_bytes().to_vec(),
        dh_public: dh.public_key().to_bytes(),
    };
    let secret = combine(kem_ss.as_bytes(), dh_ss.as_bytes(), offer, &response);
    Ok((secret, response))
}

fn transcript_hash(offer: &KeyExchangeOffer, response: &KeyExchangeResponse) -> [u8; 32] {
    let mut transcript = IncrementalHasher::new();
    transcript.update_field(HYBRID_KX_CONTEXT);
    transcript.update_field(&offer.kem_public);
    transcript.update_field(&offer.dh_public);
    transcript.update_field(&response.kem_ciphertext);
    transcript.update_field(&response.dh_public);
    transcript.finalize()
}

fn combine(
    kem_ss: &[u8; 32],
    dh_ss: &[u8; 32],
    offer: &KeyExchangeOffer,
    response: &KeyExchangeResponse,
) -> HybridSecret {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(kem_ss);
    ikm[32..].copy_from_slice(dh_ss);

    let transcript = transcript_hash(offer, response);
    let mut out = [0u8; 32];
    hkdf(&transcript, &ikm, HYBRID_KX_CONTEXT, &mut out);
    secure_wipe(&mut ikm);

    let secret = HybridSecret(Secret::new(out));
    secure_wipe(&mut out);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let (initiator, offer) = HybridInitiator::initiate();
        let (responder_secret, response) = respond(&offer).unwrap();
        let initiator_secret = initiator.complete(&response).unwrap();

        assert_eq!(initiator_secret.as_bytes(), responder_secret.as_bytes());
        assert_eq!(initiator_secret.session_id(), responder_secret.session_id());
    }

    #[test]
    fn test_sessions_are_independent() {
        let (i1, o1) = HybridInitiator::initiate();
        let (_, r1) = respond(&o1).unwrap();
        let (i2, o2) = HybridInitiator::initiate();
        let (_, r2) = respond(&o2).unwrap();

        assert_ne!(
            i1.complete(&r1).unwrap().as_bytes(),
            i2.complete(&r2).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_truncated_kem_key_rejected() {
        let (_, mut offer) = HybridInitiator::initiate();
        offer.kem_public.truncate(1000);
        assert!(matches!(
            respond(&offer),
            Err(CryptoError::InvalidKeyLength {
                expected: 1184,
                actual: 1000
            })
        ));
    }

    #[test]
    fn test_low_order_dh_key_rejected() {
        let (_, mut offer) = HybridInitiator::initiate();
        offer.dh_public = [0u8; 32];
        assert!(matches!(
            respond(&offer),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_wrong_length_ciphertext_rejected() {
        let (initiator, offer) = HybridInitiator::initiate();
        let (_, mut response) = respond(&offer).unwrap();
        response.kem_ciphertext.push(0);
        assert!(matches!(
            initiator.complete(&response),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
    }

    #[test]
    fn test_tampered_response_breaks_agreement() {
        let (initiator, offer) = HybridInitiator::initiate();
        let (responder_secret, mut response) = respond(&offer).unwrap();
        response.kem_ciphertext[0] ^= 0x01;
        let initiator_secret = initiator.complete(&response).unwrap();
        assert_ne!(initiator_secret.as_bytes(), responder_secret.as_bytes());
    }
}
