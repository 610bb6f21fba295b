//! Sparse post-quantum epoch ratchet.
//!
//! Instead of paying for a KEM on every message, each direction runs in
//! numbered epochs. The sender opens a new epoch when either the message
//! threshold or the time threshold is crossed (whichever comes first),
//! encapsulates a fresh ML-KEM secret to the peer, and mixes it into that
//! direction's epoch root. The ciphertext rides along on the epoch's
//! messages. Every message key is bound to the current epoch key, so
//! symmetric ratchet steps inherit post-quantum hardness.
//!
//! Receiver rules:
//! - ciphertext for the current or an earlier epoch: ignored
//! - ciphertext for the next epoch: decapsulated and mixed once authenticated
//! - ciphertext further ahead: buffered, bounded by `max_pending_epochs`
//!
//! A superseded epoch key is kept while the double ratchet still caches a
//! skipped message key that may belong to that epoch, and in any case for
//! the last `retained_epoch_keys` epochs. After that it is wiped.

use super::RatchetConfig;
use crate::CryptoError;
use crate::hash::{Kdf, expand_32, hkdf};
use crate::kem::{KemCiphertext, KemKeypair, KemPublicKey};
use crate::wipe::{Secret, secure_wipe};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

const MIX_INFO: &[u8] = b"ferry.sparse-pq.mix.v1";
const EPOCH_KEY_INFO: &[u8] = b"ferry.sparse-pq.epoch-key.v1";

/// Key bound into every message of one epoch.
#[derive(Clone)]
pub struct EpochKey(Secret<32>);

impl EpochKey {
    /// Borrow the key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.expose()
    }
}

/// Record of a sender-side epoch advance.
#[derive(Debug, Clone)]
pub struct EpochAdvance {
    /// Newly entered epoch
    pub epoch: u64,
    /// Ciphertext the peer needs to follow
    pub ciphertext: KemCiphertext,
}

/// Mix a fresh epoch secret into an epoch root.
#[must_use]
pub fn mix_epoch_secret(root: &Secret<32>, epoch_secret: &[u8; 32]) -> Secret<32> {
    let mut out = [0u8; 32];
    hkdf(root.expose(), epoch_secret, MIX_INFO, &mut out);
    let next = Secret::new(out);
    secure_wipe(&mut out);
    next
}

fn epoch_key(root: &Secret<32>) -> EpochKey {
    let mut key = expand_32(root.expose(), EPOCH_KEY_INFO);
    let out = EpochKey(Secret::new(key));
    secure_wipe(&mut key);
    out
}

/// Derive the two directional epoch-0 roots from the handshake secret.
///
/// Returns `(initiator_to_responder, responder_to_initiator)`.
#[must_use]
pub fn initial_roots(handshake_secret: &[u8; 32]) -> (Secret<32>, Secret<32>) {
    let kdf_i2r = Kdf::new("ferry.sparse-pq.root.initiator-to-responder.v1");
    let kdf_r2i = Kdf::new("ferry.sparse-pq.root.responder-to-initiator.v1");
    (
        Secret::new(kdf_i2r.derive_key(handshake_secret)),
        Secret::new(kdf_r2i.derive_key(handshake_secret)),
    )
}

struct SendSide {
    epoch: u64,
    root: Secret<32>,
    messages_in_epoch: u32,
    started: Instant,
    peer_kem: KemPublicKey,
    ciphertext: Option<KemCiphertext>,
}

struct RecvSide {
    epoch: u64,
    root: Secret<32>,
    kem: KemKeypair,
    retained: VecDeque<(u64, EpochKey)>,
    pending: BTreeMap<u64, KemCiphertext>,
}

/// Outcome of looking up the epoch key for an incoming message.
///
/// Nothing changes until the message authenticates and the resolution is
/// passed to [`SparsePqRatchet::commit`].
pub struct EpochResolution {
    key: EpochKey,
    advance: Option<PendingAdvance>,
}

struct PendingAdvance {
    epoch: u64,
    root: Secret<32>,
    superseded: Vec<(u64, EpochKey)>,
}

impl EpochResolution {
    /// Key for the message's epoch.
    #[must_use]
    pub fn key(&self) -> &EpochKey {
        &self.key
    }

    /// Epoch the receiver will be in after commit, if this message moves it.
    #[must_use]
    pub fn advances_to(&self) -> Option<u64> {
        self.advance.as_ref().map(|a| a.epoch)
    }
}

/// Epoch state for both directions of one session.
pub struct SparsePqRatchet {
    send: SendSide,
    recv: RecvSide,
    message_threshold: u32,
    time_threshold: Duration,
    max_pending: usize,
    retained_epochs: usize,
}

impl SparsePqRatchet {
    /// Start both directions in epoch 0.
    #[must_use]
    pub fn new(
        send_root: Secret<32>,
        recv_root: Secret<32>,
        own_kem: KemKeypair,
        peer_kem: KemPublicKey,
        config: &RatchetConfig,
        now: Instant,
    ) -> Self {
        Self {
            send: SendSide {
                epoch: 0,
                root: send_root,
                messages_in_epoch: 0,
                started: now,
                peer_kem,
                ciphertext: None,
            },
            recv: RecvSide {
                epoch: 0,
                root: recv_root,
                kem: own_kem,
                retained: VecDeque::new(),
                pending: BTreeMap::new(),
            },
            message_threshold: config.epoch_message_threshold,
            time_threshold: config.epoch_interval(),
            max_pending: config.max_pending_epochs,
            retained_epochs: config.retained_epoch_keys,
        }
    }

    /// Current sending epoch.
    #[must_use]
    pub fn send_epoch(&self) -> u64 {
        self.send.epoch
    }

    /// Current receiving epoch.
    #[must_use]
    pub fn recv_epoch(&self) -> u64 {
        self.recv.epoch
    }

    /// Messages sent in the current epoch.
    #[must_use]
    pub fn messages_in_epoch(&self) -> u32 {
        self.send.messages_in_epoch
    }

    /// Future-epoch ciphertexts waiting for the local epoch to catch up.
    #[must_use]
    pub fn pending_epochs(&self) -> usize {
        self.recv.pending.len()
    }

    /// Whether the next send should open a new epoch.
    #[must_use]
    pub fn should_advance_epoch(&self) -> bool {
        self.should_advance_at(Instant::now())
    }

    /// [`Self::should_advance_epoch`] against an explicit clock.
    #[must_use]
    pub fn should_advance_at(&self, now: Instant) -> bool {
        self.send.messages_in_epoch >= self.message_threshold
            || now.saturating_duration_since(self.send.started) >= self.time_threshold
    }

    /// Open a new sending epoch.
    ///
    /// Encapsulates to the peer's epoch key, mixes the secret into the send
    /// root and resets both the message counter and the epoch clock.
    ///
    /// # Errors
    ///
    /// Fails if the peer's KEM key cannot be used.
    pub fn advance_epoch(&mut self, now: Instant) -> Result<EpochAdvance, CryptoError> {
        let (secret, ciphertext) = self.send.peer_kem.encapsulate()?;
        self.send.root = mix_epoch_secret(&self.send.root, secret.as_bytes());
        self.send.epoch += 1;
        self.send.messages_in_epoch = 0;
        self.send.started = now;
        self.send.ciphertext = Some(ciphertext.clone());

        debug!(epoch = self.send.epoch, "opened sending epoch");
        Ok(EpochAdvance {
            epoch: self.send.epoch,
            ciphertext,
        })
    }

    /// Epoch key for the next outgoing message, advancing first if due.
    ///
    /// Returns the epoch number, its key and the ciphertext that opened the
    /// epoch (`None` in epoch 0).
    ///
    /// # Errors
    ///
    /// Propagates [`Self::advance_epoch`] failures.
    pub fn next_send_key(
        &mut self,
        now: Instant,
    ) -> Result<(u64, EpochKey, Option<KemCiphertext>), CryptoError> {
        if self.should_advance_at(now) {
            self.advance_epoch(now)?;
        }
        self.send.messages_in_epoch = self.send.messages_in_epoch.saturating_add(1);
        Ok((
            self.send.epoch,
            epoch_key(&self.send.root),
            self.send.ciphertext.clone(),
        ))
    }

    /// Look up (or compute) the key for a received message's epoch.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::EpochNotReached`] if a ciphertext for an
    ///   intermediate epoch is still missing
    /// - [`CryptoError::EpochExpired`] if the epoch's key was already wiped
    /// - [`CryptoError::EpochDesync`] if the message is further ahead than
    ///   the pending bound allows
    pub fn resolve(
        &self,
        epoch: u64,
        ciphertext: Option<&KemCiphertext>,
    ) -> Result<EpochResolution, CryptoError> {
        let current = self.recv.epoch;

        if epoch == current {
            return Ok(EpochResolution {
                key: epoch_key(&self.recv.root),
                advance: None,
            });
        }

        if epoch < current {
            return self
                .recv
                .retained
                .iter()
                .find(|(e, _)| *e == epoch)
                .map(|(_, key)| EpochResolution {
                    key: key.clone(),
                    advance: None,
                })
                .ok_or(CryptoError::EpochExpired { epoch, current });
        }

        let ahead = epoch - current;
        if ahead > self.max_pending as u64 {
            return Err(CryptoError::EpochDesync {
                pending: usize::try_from(ahead).unwrap_or(usize::MAX),
                limit: self.max_pending,
            });
        }

        let mut root = self.recv.root.clone();
        let mut superseded = Vec::new();
        for step in current + 1..=epoch {
            let ct = if step == epoch {
                ciphertext.or_else(|| self.recv.pending.get(&step))
            } else {
                self.recv.pending.get(&step)
            };
            let Some(ct) = ct else {
                return Err(CryptoError::EpochNotReached { epoch, current });
            };
            superseded.push((step - 1, epoch_key(&root)));
            let secret = self.recv.kem.decapsulate(ct)?;
            root = mix_epoch_secret(&root, secret.as_bytes());
        }

        Ok(EpochResolution {
            key: epoch_key(&root),
            advance: Some(PendingAdvance {
                epoch,
                root,
                superseded,
            }),
        })
    }

    /// Apply a resolution whose message authenticated.
    pub fn commit(&mut self, resolution: EpochResolution) {
        let Some(advance) = resolution.advance else {
            return;
        };
        if advance.epoch <= self.recv.epoch {
            return;
        }

        for entry in advance.superseded {
            self.recv.retained.push_back(entry);
        }
        self.recv.epoch = advance.epoch;
        self.recv.root = advance.root;
        self.recv.pending.retain(|e, _| *e > advance.epoch);

        debug!(epoch = self.recv.epoch, "entered receiving epoch");
    }

    /// Wipe superseded epoch keys nobody can need any more.
    ///
    /// `still_needed` is the earliest epoch a cached skipped message key was
    /// derived in. Keys from that epoch onwards, and those of the last
    /// `retained_epoch_keys` epochs, survive.
    pub fn release_epochs(&mut self, still_needed: Option<u64>) {
        let recent = self.recv.epoch.saturating_sub(self.retained_epochs as u64);
        let floor = still_needed.map_or(recent, |epoch| epoch.min(recent));
        while let Some((epoch, _)) = self.recv.retained.front() {
            if *epoch >= floor {
                break;
            }
            debug!(epoch = *epoch, "wiped superseded epoch key");
            self.recv.retained.pop_front();
        }
    }

    /// Superseded epoch keys still held.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.recv.retained.len()
    }

    /// Hold a ciphertext for an epoch more than one step ahead.
    ///
    /// Ciphertexts for the current or past epochs are ignored.
    ///
    /// # Errors
    ///
    /// [`CryptoError::EpochDesync`] once more than `max_pending_epochs`
    /// epochs are waiting.
    pub fn buffer_ciphertext(
        &mut self,
        epoch: u64,
        ciphertext: KemCiphertext,
    ) -> Result<(), CryptoError> {
        if epoch <= self.recv.epoch {
            return Ok(());
        }
        self.recv.pending.insert(epoch, ciphertext);
        if self.recv.pending.len() > self.max_pending {
            return Err(CryptoError::EpochDesync {
                pending: self.recv.pending.len(),
                limit: self.max_pending,
            });
        }
        Ok(())
    }
}
