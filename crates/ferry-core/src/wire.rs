//! Messages exchanged between two peers over one transport connection.
//!
//! [`TransferMessage`] is a closed set; every receiver matches it
//! exhaustively. Only ratchet bookkeeping travels in cleartext: file
//! content, names and sizes are inside encrypted [`SessionPayload`]s.

use crate::error::{FerryError, Result};
use crate::ids::TransferId;
use bincode::Options;
use ferry_crypto::identity::{IdentityKeypair, IdentityPublicKey, Signature};
use ferry_crypto::{KeyExchangeOffer, KeyExchangeResponse, RatchetMessage, SessionParameters};
use serde::{Deserialize, Serialize};

/// Upper bound on one encoded message (chunk plaintext plus headers)
pub const MAX_MESSAGE_SIZE: u64 = 5 * 1024 * 1024;

const SIGNING_CONTEXT: &[u8] = b"ferry.handshake-signature.v1";

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_MESSAGE_SIZE)
}

/// Top-level wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Handshake step
    KeyExchange(KeyExchangeMessage),
    /// Encrypted session payload
    Chunk(ChunkMessage),
    /// Empty encrypted message opening a new PQ epoch
    EpochAdvance(EpochAdvanceMessage),
    /// Transfer abandoned by the sending side of this message
    Cancel(CancelMessage),
}

impl TransferMessage {
    /// Encode for the transport.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] above [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Decode from the transport.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] for malformed or oversized input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(codec().deserialize(bytes)?)
    }

    /// Transfer this message belongs to.
    #[must_use]
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Self::KeyExchange(kx) => kx.transfer_id(),
            Self::Chunk(c) => c.transfer_id,
            Self::EpochAdvance(e) => e.transfer_id,
            Self::Cancel(c) => c.transfer_id,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyExchange(KeyExchangeMessage::Offer(_)) => "key-exchange-offer",
            Self::KeyExchange(KeyExchangeMessage::Accept(_)) => "key-exchange-accept",
            Self::KeyExchange(KeyExchangeMessage::Reject { .. }) => "key-exchange-reject",
            Self::Chunk(_) => "chunk",
            Self::EpochAdvance(_) => "epoch-advance",
            Self::Cancel(_) => "cancel",
        }
    }
}

/// Handshake messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchangeMessage {
    /// Initiator's ephemeral keys and ratchet parameters
    Offer(HandshakeOffer),
    /// Responder's reply
    Accept(HandshakeAccept),
    /// Responder declined
    Reject {
        /// Transfer being declined
        transfer_id: TransferId,
        /// Reason for the sender's logs
        reason: String,
    },
}

impl KeyExchangeMessage {
    fn transfer_id(&self) -> TransferId {
        match self {
            Self::Offer(o) => o.transfer_id,
            Self::Accept(a) => a.transfer_id,
            Self::Reject { transfer_id, .. } => *transfer_id,
        }
    }
}

/// Optional identity binding for a handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// Signer
    pub identity: IdentityPublicKey,
    /// Ed25519 signature over the handshake transcript
    pub signature: Vec<u8>,
}

impl IdentityProof {
    fn create(identity: &IdentityKeypair, transcript: &[u8]) -> Self {
        Self {
            identity: identity.public_key(),
            signature: identity.sign(transcript).as_bytes().to_vec(),
        }
    }

    fn verify(&self, transcript: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(&self.signature)?;
        self.identity.verify(transcript, &signature)?;
        Ok(())
    }
}

/// Initiator's handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    /// Transfer being negotiated
    pub transfer_id: TransferId,
    /// Hybrid key-exchange offer
    pub offer: KeyExchangeOffer,
    /// Initial ratchet parameters
    pub parameters: SessionParameters,
    /// Sender identity, if any
    pub proof: Option<IdentityProof>,
}

impl HandshakeOffer {
    /// Build and optionally sign an offer.
    pub fn new(
        transfer_id: TransferId,
        offer: KeyExchangeOffer,
        parameters: SessionParameters,
        identity: Option<&IdentityKeypair>,
    ) -> Self {
        let mut msg = Self {
            transfer_id,
            offer,
            parameters,
            proof: None,
        };
        msg.proof = identity.map(|id| IdentityProof::create(id, &msg.transcript()));
        msg
    }

    fn transcript(&self) -> Vec<u8> {
        let mut t = SIGNING_CONTEXT.to_vec();
        t.push(0x01);
        t.extend_from_slice(self.transfer_id.as_bytes());
        t.extend_from_slice(&self.offer.kem_public);
        t.extend_from_slice(&self.offer.dh_public);
        t.extend_from_slice(&self.parameters.ratchet_public);
        t.extend_from_slice(&self.parameters.epoch_kem_public);
        t
    }

    /// Check the identity proof.
    ///
    /// With `expected` set, the offer must be signed by exactly that
    /// identity. Without it, a present proof must still be valid.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::KeyExchange`] for a missing, mismatched or
    /// invalid signature.
    pub fn verify(&self, expected: Option<&IdentityPublicKey>) -> Result<()> {
        verify_proof(self.proof.as_ref(), expected, &self.transcript())
    }
}

/// Responder's handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccept {
    /// Transfer being negotiated
    pub transfer_id: TransferId,
    /// Hybrid key-exchange response
    pub response: KeyExchangeResponse,
    /// Initial ratchet parameters
    pub parameters: SessionParameters,
    /// Recipient identity, if any
    pub proof: Option<IdentityProof>,
}

impl HandshakeAccept {
    /// Build and optionally sign an acceptance bound to `offer`.
    pub fn new(
        offer: &HandshakeOffer,
        response: KeyExchangeResponse,
        parameters: SessionParameters,
        identity: Option<&IdentityKeypair>,
    ) -> Self {
        let mut msg = Self {
            transfer_id: offer.transfer_id,
            response,
            parameters,
            proof: None,
        };
        msg.proof = identity.map(|id| IdentityProof::create(id, &msg.transcript(offer)));
        msg
    }

    fn transcript(&self, offer: &HandshakeOffer) -> Vec<u8> {
        let mut t = offer.transcript();
        t.push(0x02);
        t.extend_from_slice(&self.response.kem_ciphertext);
        t.extend_from_slice(&self.response.dh_public);
        t.extend_from_slice(&self.parameters.ratchet_public);
        t.extend_from_slice(&self.parameters.epoch_kem_public);
        t
    }

    /// Check the identity proof against the offer this answers.
    ///
    /// # Errors
    ///
    /// As [`HandshakeOffer::verify`], plus a transfer id mismatch.
    pub fn verify(
        &self,
        offer: &HandshakeOffer,
        expected: Option<&IdentityPublicKey>,
    ) -> Result<()> {
        if self.transfer_id != offer.transfer_id {
            return Err(FerryError::KeyExchange(
                "acceptance for a different transfer".into(),
            ));
        }
        verify_proof(self.proof.as_ref(), expected, &self.transcript(offer))
    }
}

fn verify_proof(
    proof: Option<&IdentityProof>,
    expected: Option<&IdentityPublicKey>,
    transcript: &[u8],
) -> Result<()> {
    match (proof, expected) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(FerryError::KeyExchange("handshake is not signed".into())),
        (Some(proof), expected) => {
            if let Some(expected) = expected {
                if proof.identity != *expected {
                    return Err(FerryError::KeyExchange(format!(
                        "signed by {} instead of {}",
                        proof.identity.fingerprint(),
                        expected.fingerprint()
                    )));
                }
            }
            proof.verify(transcript)
        }
    }
}

/// One encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// Transfer
    pub transfer_id: TransferId,
    /// Position in this direction's payload stream
    pub sequence: u64,
    /// Ratchet output: epoch, message number, KEM ciphertext, ciphertext, tag
    pub message: RatchetMessage,
}

impl ChunkMessage {
    /// Associated data binding the ciphertext to its transfer and position.
    #[must_use]
    pub fn associated_data(transfer_id: &TransferId, sequence: u64) -> [u8; 25] {
        let mut aad = [0u8; 25];
        aad[0] = b'C';
        aad[1..17].copy_from_slice(transfer_id.as_bytes());
        aad[17..].copy_from_slice(&sequence.to_be_bytes());
        aad
    }
}

/// Forced epoch advance without data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAdvanceMessage {
    /// Transfer
    pub transfer_id: TransferId,
    /// Empty ratchet message carrying the new epoch's KEM ciphertext
    pub message: RatchetMessage,
}

impl EpochAdvanceMessage {
    /// Associated data for the carrier message.
    #[must_use]
    pub fn associated_data(transfer_id: &TransferId) -> [u8; 17] {
        let mut aad = [0u8; 17];
        aad[0] = b'E';
        aad[1..].copy_from_slice(transfer_id.as_bytes());
        aad
    }
}

/// Cancellation notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMessage {
    /// Transfer
    pub transfer_id: TransferId,
    /// Reason for the peer's logs
    pub reason: String,
}

/// Plaintext inside a [`ChunkMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// First payload of a transfer
    Manifest(Manifest),
    /// File bytes at `offset`
    Data {
        /// Byte offset in the file
        offset: u64,
        /// File bytes
        bytes: Vec<u8>,
    },
    /// No more data follows
    End {
        /// Data payloads sent
        chunks: u64,
        /// File bytes sent
        bytes: u64,
    },
    /// Receiver's verdict, sent back after `End`
    Receipt {
        /// Hash the receiver computed
        file_hash: [u8; 32],
        /// Whether it matched the manifest
        verified: bool,
    },
}

impl SessionPayload {
    /// Encode for encryption.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] on encoder failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Decode after decryption.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] for malformed plaintext.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(codec().deserialize(bytes)?)
    }
}

/// Describes the file about to be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Sender-supplied name; sanitize before use
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// BLAKE3 hash of the whole file
    pub file_hash: [u8; 32],
}
