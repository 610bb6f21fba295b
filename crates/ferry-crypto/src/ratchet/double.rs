//! Double Ratchet core.
//!
//! Signal-style ratchet for one peer session: a symmetric chain step per
//! message and a DH step whenever the peer presents a new ratchet key.
//!
//! Receiving is transactional. All state changes for a message (DH step,
//! skipped-key derivation, chain advance) are staged on a copy and only
//! committed once the caller has authenticated the message with the derived
//! key, so forged or corrupted traffic never moves the ratchet.

use super::chain::{ChainKey, MessageKey, kdf_root};
use crate::CryptoError;
use crate::wipe::Secret;
use crate::x25519::{PrivateKey, PublicKey};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Default bound on message keys derived ahead for out-of-order delivery.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Number of superseded peer ratchet keys remembered for replay detection.
const RETIRED_REMOTE_KEYS: usize = 16;

/// Per-message Double Ratchet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub ratchet_public: [u8; 32],
    /// Length of the sender's previous sending chain
    pub previous_chain_len: u32,
    /// Position in the current sending chain
    pub message_number: u32,
}

type SkippedId = ([u8; 32], u32);

/// Bounded cache of message keys for messages not yet received.
///
/// Each key remembers the receiving epoch it was derived in; the message it
/// belongs to was sent in that epoch or a later one. Eviction is
/// oldest-first; evicted keys are zeroized on drop.
struct SkippedKeys {
    order: VecDeque<SkippedId>,
    keys: HashMap<SkippedId, (MessageKey, u64)>,
    capacity: usize,
}

impl SkippedKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: SkippedId, key: MessageKey, epoch: u64) {
        while self.keys.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.keys.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(id);
        self.keys.insert(id, (key, epoch));
    }

    fn get(&self, id: &SkippedId) -> Option<&MessageKey> {
        self.keys.get(id).map(|(key, _)| key)
    }

    fn oldest_epoch(&self) -> Option<u64> {
        self.keys.values().map(|(_, epoch)| *epoch).min()
    }

    fn remove(&mut self, id: &SkippedId) {
        if self.keys.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Clone)]
struct ChainState {
    root: Secret<32>,
    dh_self: PrivateKey,
    dh_remote: Option<PublicKey>,
    send: Option<ChainKey>,
    recv: Option<ChainKey>,
    send_count: u32,
    recv_count: u32,
    previous_chain_len: u32,
}

/// Double Ratchet state for one direction pair.
pub struct DoubleRatchet {
    state: ChainState,
    skipped: SkippedKeys,
    retired_remote: VecDeque<[u8; 32]>,
    max_skip: u32,
}

impl DoubleRatchet {
    /// Initialize the side that sends first.
    ///
    /// Performs the first DH step against the responder's advertised ratchet
    /// key so a sending chain exists immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for a low-order peer key.
    pub fn new_initiator(
        shared_secret: Secret<32>,
        dh_self: PrivateKey,
        remote: PublicKey,
        max_skip: u32,
    ) -> Result<Self, CryptoError> {
        let dh = dh_self.exchange(&remote)?;
        let (root, send) = kdf_root(&shared_secret, dh.as_bytes());
        Ok(Self {
            state: ChainState {
                root,
                dh_self,
                dh_remote: Some(remote),
                send: Some(send),
                recv: None,
                send_count: 0,
                recv_count: 0,
                previous_chain_len: 0,
            },
            skipped: SkippedKeys::new(max_skip as usize),
            retired_remote: VecDeque::new(),
            max_skip,
        })
    }

    /// Initialize the side that must receive before it can send.
    #[must_use]
    pub fn new_responder(shared_secret: Secret<32>, dh_self: PrivateKey, max_skip: u32) -> Self {
        Self {
            state: ChainState {
                root: shared_secret,
                dh_self,
                dh_remote: None,
                send: None,
                recv: None,
                send_count: 0,
                recv_count: 0,
                previous_chain_len: 0,
            },
            skipped: SkippedKeys::new(max_skip as usize),
            retired_remote: VecDeque::new(),
            max_skip,
        }
    }

    /// Our current ratchet public key.
    #[must_use]
    pub fn ratchet_public(&self) -> [u8; 32] {
        self.state.dh_self.public_key().to_bytes()
    }

    /// Whether a sending chain exists yet.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state.send.is_some()
    }

    /// Number of cached skipped message keys.
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Earliest receiving epoch any cached skipped key was derived in.
    ///
    /// Epoch keys from this epoch onwards may still be needed to open a
    /// delayed message.
    #[must_use]
    pub fn oldest_skipped_epoch(&self) -> Option<u64> {
        self.skipped.oldest_epoch()
    }

    /// Advance the sending chain, returning the header and the one-time key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidState`] before the first receive on the
    /// responder side, [`CryptoError::CounterOverflow`] when the chain is
    /// exhausted.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        let ratchet_public = self.ratchet_public();
        let state = &mut self.state;
        let send = state
            .send
            .as_mut()
            .ok_or(CryptoError::InvalidState(
                "no sending chain before first receive",
            ))?;
        if state.send_count == u32::MAX {
            return Err(CryptoError::CounterOverflow);
        }

        let key = send.ratchet();
        let header = RatchetHeader {
            ratchet_public,
            previous_chain_len: state.previous_chain_len,
            message_number: state.send_count,
        };
        state.send_count += 1;
        Ok((header, key))
    }

    /// Derive the key for an incoming message and hand it to `open`.
    ///
    /// State is committed only if `open` succeeds. Keys skipped on the way
    /// are tagged with `epoch`, the caller's receiving epoch before this
    /// message.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::ReplayDetected`] for an already-consumed message
    /// - [`CryptoError::SkipLimitExceeded`] if the gap exceeds the skip bound
    /// - whatever `open` returns
    pub fn decrypt_with<T>(
        &mut self,
        header: &RatchetHeader,
        epoch: u64,
        open: impl FnOnce(&MessageKey) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let id = (header.ratchet_public, header.message_number);
        if let Some(key) = self.skipped.get(&id) {
            let out = open(key)?;
            self.skipped.remove(&id);
            return Ok(out);
        }

        if self.retired_remote.contains(&header.ratchet_public) {
            return Err(CryptoError::ReplayDetected {
                message_number: header.message_number,
            });
        }

        let current_remote = self.state.dh_remote.map(|pk| pk.to_bytes());
        let new_remote = current_remote != Some(header.ratchet_public);
        if !new_remote && header.message_number < self.state.recv_count {
            return Err(CryptoError::ReplayDetected {
                message_number: header.message_number,
            });
        }

        let mut next = self.state.clone();
        let mut staged = Vec::new();
        if new_remote {
            self.skip_until(&mut next, header.previous_chain_len, &mut staged)?;
            dh_step(&mut next, header)?;
        }
        self.skip_until(&mut next, header.message_number, &mut staged)?;

        let recv = next
            .recv
            .as_mut()
            .ok_or(CryptoError::InvalidState("no receiving chain"))?;
        let key = recv.ratchet();
        next.recv_count = next
            .recv_count
            .checked_add(1)
            .ok_or(CryptoError::CounterOverflow)?;

        let out = open(&key)?;

        if new_remote {
            if let Some(old) = current_remote {
                self.retired_remote.push_back(old);
                if self.retired_remote.len() > RETIRED_REMOTE_KEYS {
                    self.retired_remote.pop_front();
                }
            }
        }
        self.state = next;
        for (id, key) in staged {
            self.skipped.insert(id, key, epoch);
        }
        Ok(out)
    }

    fn skip_until(
        &self,
        state: &mut ChainState,
        until: u32,
        staged: &mut Vec<(SkippedId, MessageKey)>,
    ) -> Result<(), CryptoError> {
        let (Some(recv), Some(remote)) = (state.recv.as_mut(), state.dh_remote) else {
            return Ok(());
        };
        if until <= state.recv_count {
            return Ok(());
        }

        let gap = u64::from(until - state.recv_count);
        if gap > u64::from(self.max_skip) {
            return Err(CryptoError::SkipLimitExceeded {
                gap,
                max_skip: self.max_skip,
            });
        }

        let remote = remote.to_bytes();
        while state.recv_count < until {
            staged.push(((remote, state.recv_count), recv.ratchet()));
            state.recv_count += 1;
        }
        Ok(())
    }
}

fn dh_step(state: &mut ChainState, header: &RatchetHeader) -> Result<(), CryptoError> {
    let remote = PublicKey::from_bytes(header.ratchet_public);

    state.previous_chain_len = state.send_count;
    state.send_count = 0;
    state.recv_count = 0;

    let dh_recv = state.dh_self.exchange(&remote)?;
    let (root, recv) = kdf_root(&state.root, dh_recv.as_bytes());

    state.dh_self = PrivateKey::generate();
    let dh_send = state.dh_self.exchange(&remote)?;
    let (root, send) = kdf_root(&root, dh_send.as_bytes());

    state.root = root;
    state.recv = Some(recv);
    state.send = Some(send);
    state.dh_remote = Some(remote);
    Ok(())
}

impl fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("ratchet_public", &hex::encode(&self.ratchet_public()[..8]))
            .field("send_count", &self.state.send_count)
            .field("recv_count", &self.state.recv_count)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
