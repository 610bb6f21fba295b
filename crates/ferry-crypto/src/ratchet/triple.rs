//! Composite "triple ratchet" session.
//!
//! Binds the Double Ratchet and the sparse PQ epoch ratchet into a single
//! encrypt/decrypt interface. Each message key is
//! `KDF(double ratchet message key ‖ epoch key)`, so an attacker has to break
//! both the classical chain and the current post-quantum epoch.
//!
//! ```text
//!  Uninitialized ──init_session──► KeyExchanged ──first encrypt/decrypt──► Established
//!        │                              │                                     │ ▲
//!        │                              │                                     └─┘ encrypt / decrypt
//!        └──────────────────────────────┴── close() or fatal error ──► Terminated
//! ```
//!
//! Fatal errors (skip bound exceeded, epoch desynchronization, counter
//! exhaustion) wipe all key material and move the session to `Terminated`;
//! every later call fails with [`CryptoError::SessionTerminated`].

use super::RatchetConfig;
use super::chain::MessageKey;
use super::double::{DoubleRatchet, RatchetHeader};
use super::sparse_pq::{EpochKey, SparsePqRatchet, initial_roots};
use crate::CryptoError;
use crate::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE, Tag};
use crate::hash::Kdf;
use crate::hybrid::HybridSecret;
use crate::kem::{KemCiphertext, KemKeypair, KemPublicKey};
use crate::wipe::{Secret, secure_wipe};
use crate::x25519::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

const MESSAGE_KEY_CONTEXT: &str = "ferry.triple.message-key.v1";
const DOUBLE_RATCHET_ROOT_CONTEXT: &str = "ferry.triple.double-ratchet-root.v1";

/// Which side of the handshake this session played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Sent the key-exchange offer; sends first
    Initiator,
    /// Answered the offer; must receive before sending
    Responder,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Local keys generated, handshake not complete
    Uninitialized,
    /// Ratchets seeded, no message exchanged yet
    KeyExchanged,
    /// At least one message encrypted or decrypted
    Established,
    /// Closed or torn down; key material wiped
    Terminated,
}

/// Public ratchet parameters exchanged alongside the hybrid handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    /// Initial Double Ratchet public key
    pub ratchet_public: [u8; 32],
    /// ML-KEM key the peer encapsulates epoch secrets to
    pub epoch_kem_public: Vec<u8>,
}

/// Cleartext bookkeeping carried with each message.
///
/// Authenticated as associated data; never contains file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's epoch
    pub epoch: u64,
    /// Position in the sender's current chain
    pub message_number: u32,
    /// Length of the sender's previous chain
    pub previous_chain_len: u32,
    /// Sender's current ratchet public key
    pub ratchet_public: [u8; 32],
    /// KEM ciphertext that opened `epoch` (absent in epoch 0)
    pub kem_ciphertext: Option<Vec<u8>>,
}

impl MessageHeader {
    /// Canonical encoding used as associated data.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let ct_len = self.kem_ciphertext.as_ref().map_or(0, Vec::len);
        let mut out = Vec::with_capacity(8 + 4 + 4 + 32 + 1 + ct_len);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.message_number.to_be_bytes());
        out.extend_from_slice(&self.previous_chain_len.to_be_bytes());
        out.extend_from_slice(&self.ratchet_public);
        match &self.kem_ciphertext {
            Some(ct) => {
                out.push(1);
                out.extend_from_slice(ct);
            }
            None => out.push(0),
        }
        out
    }

    fn ratchet_header(&self) -> RatchetHeader {
        RatchetHeader {
            ratchet_public: self.ratchet_public,
            previous_chain_len: self.previous_chain_len,
            message_number: self.message_number,
        }
    }
}

/// One encrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Cleartext header
    pub header: MessageHeader,
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Poly1305 tag
    pub tag: [u8; TAG_SIZE],
}

struct LocalKeys {
    ratchet: PrivateKey,
    epoch_kem: KemKeypair,
}

/// Triple ratchet session between two peers.
pub struct TripleRatchetSession {
    role: Role,
    state: SessionState,
    config: RatchetConfig,
    parameters: SessionParameters,
    local: Option<LocalKeys>,
    double: Option<DoubleRatchet>,
    sparse: Option<SparsePqRatchet>,
    session_id: Option<[u8; 16]>,
}

impl TripleRatchetSession {
    /// Create a session in `Uninitialized`, generating the local ratchet key
    /// and epoch KEM keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParameter`] for an invalid config.
    pub fn new(role: Role, config: RatchetConfig) -> Result<Self, CryptoError> {
        config.validate()?;
        let ratchet = PrivateKey::generate();
        let epoch_kem = KemKeypair::generate();
        let parameters = SessionParameters {
            ratchet_public: ratchet.public_key().to_bytes(),
            epoch_kem_public: epoch_kem.public_key().as_bytes().to_vec(),
        };
        Ok(Self {
            role,
            state: SessionState::Uninitialized,
            config,
            parameters,
            local: Some(LocalKeys { ratchet, epoch_kem }),
            double: None,
            sparse: None,
            session_id: None,
        })
    }

    /// Parameters to send to the peer with the handshake.
    #[must_use]
    pub fn local_parameters(&self) -> &SessionParameters {
        &self.parameters
    }

    /// Handshake role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identifier shared by both ends, available after `init_session`.
    #[must_use]
    pub fn session_id(&self) -> Option<[u8; 16]> {
        self.session_id
    }

    /// Current sending epoch.
    #[must_use]
    pub fn send_epoch(&self) -> Option<u64> {
        self.sparse.as_ref().map(SparsePqRatchet::send_epoch)
    }

    /// Current receiving epoch.
    #[must_use]
    pub fn recv_epoch(&self) -> Option<u64> {
        self.sparse.as_ref().map(SparsePqRatchet::recv_epoch)
    }

    /// Whether the next encrypt will open a new epoch.
    #[must_use]
    pub fn should_advance_epoch(&self) -> bool {
        self.sparse
            .as_ref()
            .is_some_and(SparsePqRatchet::should_advance_epoch)
    }

    /// Whether this side may encrypt yet.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.double.as_ref().is_some_and(DoubleRatchet::can_send)
    }

    /// Seed both ratchets from the handshake secret and the peer's
    /// parameters. Moves the session to `KeyExchanged`.
    ///
    /// # Errors
    ///
    /// Fails on malformed peer keys or if called twice. Nothing is retained
    /// on failure.
    pub fn init_session(
        &mut self,
        handshake: &HybridSecret,
        peer: &SessionParameters,
    ) -> Result<(), CryptoError> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Terminated => return Err(CryptoError::SessionTerminated),
            _ => return Err(CryptoError::InvalidState("session already initialized")),
        }
        let peer_kem = KemPublicKey::from_bytes(&peer.epoch_kem_public)?;
        let peer_ratchet = PublicKey::from_bytes(peer.ratchet_public);
        let local = self
            .local
            .take()
            .ok_or(CryptoError::InvalidState("local keys already consumed"))?;

        let root =
            Secret::new(Kdf::new(DOUBLE_RATCHET_ROOT_CONTEXT).derive_key(handshake.as_bytes()));
        let (i2r, r2i) = initial_roots(handshake.as_bytes());
        let now = Instant::now();

        let (double, send_root, recv_root) = match self.role {
            Role::Initiator => {
                let double = DoubleRatchet::new_initiator(
                    root,
                    local.ratchet,
                    peer_ratchet,
                    self.config.max_skip,
                )?;
                (double, i2r, r2i)
            }
            Role::Responder => {
                let double =
                    DoubleRatchet::new_responder(root, local.ratchet, self.config.max_skip);
                (double, r2i, i2r)
            }
        };

        self.sparse = Some(SparsePqRatchet::new(
            send_root,
            recv_root,
            local.epoch_kem,
            peer_kem,
            &self.config,
            now,
        ));
        self.double = Some(double);
        self.session_id = Some(handshake.session_id());
        self.state = SessionState::KeyExchanged;

        info!(
            session = %hex::encode(handshake.session_id()),
            role = ?self.role,
            "ratchet session keyed"
        );
        Ok(())
    }

    /// Encrypt one message.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt_at`].
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<RatchetMessage, CryptoError> {
        self.encrypt_at(plaintext, aad, Instant::now())
    }

    /// Encrypt one message, using `now` for the epoch time threshold.
    ///
    /// `aad` is authenticated alongside the header but not transmitted.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::SessionTerminated`] after close or a fatal error
    /// - [`CryptoError::InvalidState`] before key exchange, or on the
    ///   responder before its first receive
    pub fn encrypt_at(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        now: Instant,
    ) -> Result<RatchetMessage, CryptoError> {
        self.ensure_active()?;
        let result = self.try_encrypt(plaintext, aad, now);
        self.absorb(result)
    }

    /// Open a new sending epoch immediately, regardless of thresholds.
    ///
    /// Returns an empty authenticated message carrying the new epoch's KEM
    /// ciphertext, for use when no data is pending.
    ///
    /// # Errors
    ///
    /// Same as [`Self::encrypt_at`].
    pub fn rekey(&mut self, aad: &[u8]) -> Result<RatchetMessage, CryptoError> {
        self.ensure_active()?;
        if !self.can_send() {
            return Err(CryptoError::InvalidState(
                "responder must receive before sending",
            ));
        }
        let now = Instant::now();
        let advanced = match self.sparse.as_mut() {
            Some(sparse) => sparse.advance_epoch(now).map(|_| ()),
            None => Err(CryptoError::InvalidState("ratchets not seeded")),
        };
        let result = advanced.and_then(|()| self.try_encrypt(&[], aad, now));
        self.absorb(result)
    }

    fn try_encrypt(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        now: Instant,
    ) -> Result<RatchetMessage, CryptoError> {
        let (Some(double), Some(sparse)) = (self.double.as_mut(), self.sparse.as_mut()) else {
            return Err(CryptoError::InvalidState("ratchets not seeded"));
        };
        if !double.can_send() {
            return Err(CryptoError::InvalidState(
                "responder must receive before sending",
            ));
        }

        let (epoch, epoch_key, kem_ciphertext) = sparse.next_send_key(now)?;
        let (dr_header, message_key) = double.encrypt_step()?;

        let header = MessageHeader {
            epoch,
            message_number: dr_header.message_number,
            previous_chain_len: dr_header.previous_chain_len,
            ratchet_public: dr_header.ratchet_public,
            kem_ciphertext: kem_ciphertext.map(|ct| ct.as_bytes().to_vec()),
        };

        let (key, nonce) = message_cipher(&message_key, &epoch_key);
        let mut ciphertext = plaintext.to_vec();
        let tag = key.seal_in_place(&nonce, &mut ciphertext, &associated_data(&header, aad))?;

        debug!(
            epoch,
            n = header.message_number,
            len = plaintext.len(),
            "encrypted message"
        );
        self.state = SessionState::Established;
        Ok(RatchetMessage {
            header,
            ciphertext,
            tag: tag.to_bytes(),
        })
    }

    /// Decrypt one message.
    ///
    /// Out-of-order messages within the skip bound decrypt from cached keys.
    /// A message number that was already consumed is rejected.
    ///
    /// # Errors
    ///
    /// Non-fatal: [`CryptoError::ReplayDetected`],
    /// [`CryptoError::EpochNotReached`], [`CryptoError::DecryptionFailed`];
    /// the session is unchanged. Fatal errors terminate the session.
    pub fn decrypt(
        &mut self,
        message: &RatchetMessage,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.ensure_active()?;
        let result = self.try_decrypt(message, aad);
        self.absorb(result)
    }

    fn try_decrypt(
        &mut self,
        message: &RatchetMessage,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (Some(double), Some(sparse)) = (self.double.as_mut(), self.sparse.as_mut()) else {
            return Err(CryptoError::InvalidState("ratchets not seeded"));
        };
        let header = &message.header;
        let kem_ciphertext = header
            .kem_ciphertext
            .as_deref()
            .map(KemCiphertext::from_bytes)
            .transpose()?;

        let resolution = match sparse.resolve(header.epoch, kem_ciphertext.as_ref()) {
            Ok(resolution) => resolution,
            Err(err @ CryptoError::EpochNotReached { .. }) => {
                if let Some(ct) = kem_ciphertext {
                    sparse.buffer_ciphertext(header.epoch, ct)?;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let aad = associated_data(header, aad);
        let tag = Tag::from_bytes(message.tag);
        let recv_epoch = sparse.recv_epoch();
        let plaintext =
            double.decrypt_with(&header.ratchet_header(), recv_epoch, |message_key| {
                let (key, nonce) = message_cipher(message_key, resolution.key());
                let mut buffer = message.ciphertext.clone();
                key.open_in_place(&nonce, &mut buffer, &tag, &aad)?;
                Ok(buffer)
            })?;

        if let Some(epoch) = resolution.advances_to() {
            info!(epoch, "peer advanced epoch");
        }
        sparse.commit(resolution);
        sparse.release_epochs(double.oldest_skipped_epoch());

        debug!(
            epoch = header.epoch,
            n = header.message_number,
            "decrypted message"
        );
        self.state = SessionState::Established;
        Ok(plaintext)
    }

    /// Wipe all key material and enter `Terminated`. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Terminated {
            debug!(role = ?self.role, "closing ratchet session");
        }
        self.double = None;
        self.sparse = None;
        self.local = None;
        self.state = SessionState::Terminated;
    }

    fn ensure_active(&self) -> Result<(), CryptoError> {
        match self.state {
            SessionState::KeyExchanged | SessionState::Established => Ok(()),
            SessionState::Uninitialized => {
                Err(CryptoError::InvalidState("key exchange not complete"))
            }
            SessionState::Terminated => Err(CryptoError::SessionTerminated),
        }
    }

    fn absorb<T>(&mut self, result: Result<T, CryptoError>) -> Result<T, CryptoError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(error = %err, role = ?self.role, "fatal ratchet error, tearing session down");
                self.close();
            }
        }
        result
    }
}

impl Drop for TripleRatchetSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TripleRatchetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripleRatchetSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("session_id", &self.session_id.map(hex::encode))
            .field("send_epoch", &self.send_epoch())
            .field("recv_epoch", &self.recv_epoch())
            .finish_non_exhaustive()
    }
}

fn associated_data(header: &MessageHeader, aad: &[u8]) -> Vec<u8> {
    let mut out = header.encode();
    out.extend_from_slice(&(aad.len() as u64).to_be_bytes());
    out.extend_from_slice(aad);
    out
}

fn message_cipher(message_key: &MessageKey, epoch_key: &EpochKey) -> (AeadKey, Nonce) {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(message_key.as_bytes());
    ikm[32..].copy_from_slice(epoch_key.as_bytes());

    let mut okm = [0u8; 32 + NONCE_SIZE];
    Kdf::new(MESSAGE_KEY_CONTEXT).derive(&ikm, &mut okm);

    let mut key = [0u8; 32];
    let mut nonce = [0u8; NONCE_SIZE];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    let cipher = (AeadKey::new(key), Nonce::from_bytes(nonce));

    secure_wipe(&mut ikm);
    secure_wipe(&mut okm);
    secure_wipe(&mut key);
    cipher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::{HybridInitiator, respond};

    pub(crate) fn connected(config: RatchetConfig) -> (TripleRatchetSession, TripleRatchetSession) {
        let mut alice = TripleRatchetSession::new(Role::Initiator, config.clone()).unwrap();
        let mut bob = TripleRatchetSession::new(Role::Responder, config).unwrap();

        let (initiator, offer) = HybridInitiator::initiate();
        let (bob_secret, response) = respond(&offer).unwrap();
        let alice_secret = initiator.complete(&response).unwrap();

        let alice_params = alice.local_parameters().clone();
        let bob_params = bob.local_parameters().clone();
        alice.init_session(&alice_secret, &bob_params).unwrap();
        bob.init_session(&bob_secret, &alice_params).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_state_machine() {
        let mut alice =
            TripleRatchetSession::new(Role::Initiator, RatchetConfig::default()).unwrap();
        assert_eq!(alice.state(), SessionState::Uninitialized);
        assert!(matches!(
            alice.encrypt(b"x", b""),
            Err(CryptoError::InvalidState(_))
        ));

        let (mut alice, mut bob) = connected(RatchetConfig::default());
        assert_eq!(alice.state(), SessionState::KeyExchanged);
        let m = alice.encrypt(b"hello", b"").unwrap();
        assert_eq!(alice.state(), SessionState::Established);
        assert_eq!(bob.decrypt(&m, b"").unwrap(), b"hello");
        assert_eq!(bob.state(), SessionState::Established);

        bob.close();
        assert_eq!(bob.state(), SessionState::Terminated);
        assert_eq!(bob.decrypt(&m, b""), Err(CryptoError::SessionTerminated));
    }

    #[test]
    fn test_session_ids_match() {
        let (alice, bob) = connected(RatchetConfig::default());
        assert!(alice.session_id().is_some());
        assert_eq!(alice.session_id(), bob.session_id());
    }

    #[test]
    fn test_responder_waits_for_first_message() {
        let (_alice, mut bob) = connected(RatchetConfig::default());
        assert!(!bob.can_send());
        assert!(matches!(
            bob.encrypt(b"too early", b""),
            Err(CryptoError::InvalidState(_))
        ));
        assert_eq!(bob.state(), SessionState::KeyExchanged);
    }

    #[test]
    fn test_bidirectional_with_epochs() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        for i in 0..40u32 {
            let m = alice.encrypt(&i.to_le_bytes(), b"a2b").unwrap();
            assert_eq!(bob.decrypt(&m, b"a2b").unwrap(), i.to_le_bytes());
            let r = bob.encrypt(&i.to_be_bytes(), b"b2a").unwrap();
            assert_eq!(alice.decrypt(&r, b"b2a").unwrap(), i.to_be_bytes());
        }
        assert_eq!(alice.send_epoch(), Some(3));
        assert_eq!(bob.recv_epoch(), Some(3));
        assert_eq!(bob.send_epoch(), Some(3));
    }

    #[test]
    fn test_aad_is_bound() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let m = alice.encrypt(b"chunk", b"seq=1").unwrap();
        assert_eq!(
            bob.decrypt(&m, b"seq=2"),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(bob.decrypt(&m, b"seq=1").unwrap(), b"chunk");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let mut m = alice.encrypt(b"chunk", b"").unwrap();
        m.header.previous_chain_len += 1;
        assert!(bob.decrypt(&m, b"").is_err());
        assert_ne!(bob.state(), SessionState::Terminated);
    }

    #[test]
    fn test_duplicate_rejected_without_teardown() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let m = alice.encrypt(b"once", b"").unwrap();
        bob.decrypt(&m, b"").unwrap();
        assert_eq!(
            bob.decrypt(&m, b""),
            Err(CryptoError::ReplayDetected { message_number: 0 })
        );
        let next = alice.encrypt(b"twice", b"").unwrap();
        assert_eq!(bob.decrypt(&next, b"").unwrap(), b"twice");
    }

    #[test]
    fn test_skip_bound_terminates() {
        let config = RatchetConfig {
            max_skip: 5,
            ..RatchetConfig::default()
        };
        let (mut alice, mut bob) = connected(config);
        let msgs: Vec<_> = (0..8u8)
            .map(|i| alice.encrypt(&[i], b"").unwrap())
            .collect();
        let err = bob.decrypt(&msgs[7], b"").unwrap_err();
        assert!(matches!(err, CryptoError::SkipLimitExceeded { gap: 7, .. }));
        assert_eq!(bob.state(), SessionState::Terminated);
        assert_eq!(
            bob.decrypt(&msgs[0], b""),
            Err(CryptoError::SessionTerminated)
        );
    }

    #[test]
    fn test_out_of_order_across_epochs() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let msgs: Vec<_> = (0..25u8)
            .map(|i| alice.encrypt(&[i], b"").unwrap())
            .collect();

        // Epoch 1 first, then the tail of epoch 0, then epoch 2.
        for i in (10..20).rev() {
            assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
        }
        for i in 0..10 {
            assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
        }
        for i in 20..25 {
            assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
        }
        assert_eq!(bob.recv_epoch(), Some(2));
    }

    #[test]
    fn test_delayed_first_message_survives_many_epochs() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let msgs: Vec<_> = (0..35u8)
            .map(|i| alice.encrypt(&[i], b"").unwrap())
            .collect();
        for i in 1..35 {
            assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
        }
        assert_eq!(bob.recv_epoch(), Some(3));
        assert_eq!(bob.decrypt(&msgs[0], b"").unwrap(), vec![0]);
        assert_eq!(bob.state(), SessionState::Established);
    }

    #[test]
    fn test_epoch_two_ahead_waits_then_succeeds() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let msgs: Vec<_> = (0..21u8)
            .map(|i| alice.encrypt(&[i], b"").unwrap())
            .collect();

        assert!(matches!(
            bob.decrypt(&msgs[20], b""),
            Err(CryptoError::EpochNotReached {
                epoch: 2,
                current: 0,
            })
        ));
        assert_ne!(bob.state(), SessionState::Terminated);

        assert_eq!(bob.decrypt(&msgs[10], b"").unwrap(), vec![10]);
        assert_eq!(bob.decrypt(&msgs[20], b"").unwrap(), vec![20]);
        assert_eq!(bob.recv_epoch(), Some(2));
    }

    #[test]
    fn test_time_threshold_advances_epoch() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let start = Instant::now();
        let m = alice.encrypt_at(b"early", b"", start).unwrap();
        assert_eq!(m.header.epoch, 0);
        bob.decrypt(&m, b"").unwrap();

        let later = start + RatchetConfig::default().epoch_interval();
        let m = alice.encrypt_at(b"late", b"", later).unwrap();
        assert_eq!(m.header.epoch, 1);
        assert!(m.header.kem_ciphertext.is_some());
        assert_eq!(bob.decrypt(&m, b"").unwrap(), b"late");
    }

    #[test]
    fn test_rekey_opens_epoch_without_data() {
        let (mut alice, mut bob) = connected(RatchetConfig::default());
        let first = alice.encrypt(b"hi", b"").unwrap();
        bob.decrypt(&first, b"").unwrap();

        let carrier = alice.rekey(b"ctx").unwrap();
        assert_eq!(carrier.header.epoch, 1);
        assert!(carrier.header.kem_ciphertext.is_some());
        assert!(carrier.ciphertext.is_empty());
        assert_eq!(bob.decrypt(&carrier, b"ctx").unwrap(), Vec::<u8>::new());
        assert_eq!(bob.recv_epoch(), Some(1));

        let next = alice.encrypt(b"after", b"").unwrap();
        assert_eq!(next.header.epoch, 1);
        assert_eq!(bob.decrypt(&next, b"").unwrap(), b"after");
    }

    #[test]
    fn test_rekey_requires_send_capability() {
        let (_alice, mut bob) = connected(RatchetConfig::default());
        assert!(matches!(bob.rekey(b""), Err(CryptoError::InvalidState(_))));
        assert_eq!(bob.send_epoch(), Some(0));
    }

    #[test]
    fn test_header_encoding_is_stable() {
        let header = MessageHeader {
            epoch: 1,
            message_number: 2,
            previous_chain_len: 3,
            ratchet_public: [4; 32],
            kem_ciphertext: None,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), 8 + 4 + 4 + 32 + 1);
        assert_eq!(&encoded[..8], &1u64.to_be_bytes());
        assert_eq!(*encoded.last().unwrap(), 0);
    }
}
