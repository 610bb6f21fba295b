//! Group signaling messages.
//!
//! Invites, join/reject responses and cancellation notices travel over an
//! external signaling channel. Every envelope carries a unix-millisecond
//! timestamp checked against a freshness window, and may be signed by the
//! sender's identity key.

use crate::error::{FerryError, Result};
use crate::ids::GroupId;
use crate::recipient::RecipientId;
use ferry_crypto::identity::{IdentityKeypair, IdentityPublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

const SIGNALING_CONTEXT: &[u8] = b"ferry.signaling.v1";

/// Invitation to join a group transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    /// Group
    pub group_id: GroupId,
    /// Invited recipient
    pub recipient_id: RecipientId,
    /// Sender's display name
    pub sender_name: String,
    /// Sender's identity key, if it has one
    pub sender_identity: Option<IdentityPublicKey>,
    /// Announced file name
    pub file_name: String,
    /// Announced file size
    pub file_size: u64,
    /// Number of recipients in the group
    pub recipient_count: u32,
}

/// Signaling message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalBody {
    /// Sender invites one recipient
    Invite(GroupInvite),
    /// Recipient joins
    Join {
        /// Group
        group_id: GroupId,
        /// Joining recipient
        recipient_id: RecipientId,
    },
    /// Recipient declines
    Reject {
        /// Group
        group_id: GroupId,
        /// Declining recipient
        recipient_id: RecipientId,
        /// Reason shown to the sender
        reason: String,
    },
    /// Sender cancels the whole group
    Cancel {
        /// Group
        group_id: GroupId,
        /// Reason shown to recipients
        reason: String,
    },
}

impl SignalBody {
    /// Group the message refers to.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        match self {
            Self::Invite(invite) => invite.group_id,
            Self::Join { group_id, .. }
            | Self::Reject { group_id, .. }
            | Self::Cancel { group_id, .. } => *group_id,
        }
    }
}

/// Timestamped, optionally signed signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Creation time, unix milliseconds
    pub timestamp_ms: u64,
    /// Message
    pub body: SignalBody,
    /// Signer and Ed25519 signature over timestamp and body
    pub signature: Option<(IdentityPublicKey, Vec<u8>)>,
}

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl SignalEnvelope {
    /// Stamp `body` with the current time and sign it when an identity is given.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] if the body cannot be encoded.
    pub fn seal(body: SignalBody, identity: Option<&IdentityKeypair>) -> Result<Self> {
        Self::seal_at(body, identity, unix_millis())
    }

    /// [`Self::seal`] with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] if the body cannot be encoded.
    pub fn seal_at(
        body: SignalBody,
        identity: Option<&IdentityKeypair>,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let mut envelope = Self {
            timestamp_ms,
            body,
            signature: None,
        };
        if let Some(identity) = identity {
            let signed = envelope.signed_bytes()?;
            envelope.signature = Some((
                identity.public_key(),
                identity.sign(&signed).as_bytes().to_vec(),
            ));
        }
        Ok(envelope)
    }

    fn signed_bytes(&self) -> Result<Vec<u8>> {
        let mut out = SIGNALING_CONTEXT.to_vec();
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&bincode::serialize(&self.body)?);
        Ok(out)
    }

    /// Check freshness and signature, returning the body.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Validation`] if older than `freshness` or more than
    ///   `future_skew` ahead of the local clock
    /// - [`FerryError::KeyExchange`] for a missing or invalid signature
    ///   when `expected_signer` is set, or an invalid signature otherwise
    pub fn open(
        &self,
        freshness: Duration,
        future_skew: Duration,
        expected_signer: Option<&IdentityPublicKey>,
    ) -> Result<&SignalBody> {
        self.open_at(unix_millis(), freshness, future_skew, expected_signer)
    }

    /// [`Self::open`] against an explicit clock.
    ///
    /// # Errors
    ///
    /// As [`Self::open`].
    pub fn open_at(
        &self,
        now_ms: u64,
        freshness: Duration,
        future_skew: Duration,
        expected_signer: Option<&IdentityPublicKey>,
    ) -> Result<&SignalBody> {
        if self.timestamp_ms > now_ms.saturating_add(future_skew.as_millis() as u64) {
            warn!(group = %self.body.group_id(), "signaling message from the future");
            return Err(FerryError::validation(
                "signaling timestamp is in the future",
            ));
        }
        if now_ms.saturating_sub(self.timestamp_ms) > freshness.as_millis() as u64 {
            warn!(group = %self.body.group_id(), "stale signaling message");
            return Err(FerryError::validation("signaling message is stale"));
        }

        match (&self.signature, expected_signer) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(FerryError::KeyExchange(
                    "signaling message is not signed".into(),
                ));
            }
            (Some((signer, signature)), expected) => {
                if expected.is_some_and(|e| e != signer) {
                    return Err(FerryError::KeyExchange(
                        "signaling message signed by an unexpected identity".into(),
                    ));
                }
                let signature = Signature::from_slice(signature)?;
                signer.verify(&self.signed_bytes()?, &signature)?;
            }
        }
        Ok(&self.body)
    }
}
