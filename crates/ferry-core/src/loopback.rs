//! In-process [`Connector`] backed by simulated channels.
//!
//! Every connection spawns an [`IncomingTransfer`] on the far side, so a
//! whole group transfer runs inside one runtime. Peers can be told to
//! decline invites or to lose their link after a number of frames.

use crate::config::{FerryConfig, SIGNALING_FUTURE_SKEW};
use crate::error::{FerryError, Result};
use crate::link::{Connector, PeerLink};
use crate::receiver::{Destination, IncomingTransfer, ReceiveOptions, ReceivedFile};
use crate::recipient::{RecipientDescriptor, RecipientId};
use crate::signaling::{SignalBody, SignalEnvelope};
use async_trait::async_trait;
use dashmap::DashMap;
use ferry_crypto::identity::{IdentityKeypair, IdentityPublicKey};
use ferry_transport::simulated::{LinkProfile, SimulatedChannel, duplex};
use ferry_transport::{Channel, ParallelTransport, TransportError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Behaviour of one simulated recipient
#[derive(Debug, Clone, Default)]
pub struct PeerBehavior {
    /// Recipient's identity key
    pub identity: Option<Arc<IdentityKeypair>>,
    /// Sender identity the recipient insists on
    pub expected_sender: Option<IdentityPublicKey>,
    /// Decline invites with this reason
    pub decline: Option<String>,
    /// Cut every channel after this many frames reach the recipient
    pub fail_after_frames: Option<u64>,
    /// Where the recipient stores the file; memory by default
    pub destination: Option<Destination>,
    /// Link to this recipient; the connector's profile by default
    pub link: Option<LinkProfile>,
}

impl PeerBehavior {
    /// Recipient that joins and receives into memory.
    #[must_use]
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Recipient that declines the invite.
    #[must_use]
    pub fn declining(reason: impl Into<String>) -> Self {
        Self {
            decline: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Recipient whose link dies after `frames` frames.
    #[must_use]
    pub fn failing_after(frames: u64) -> Self {
        Self {
            fail_after_frames: Some(frames),
            ..Self::default()
        }
    }

    /// Set the recipient's identity.
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<IdentityKeypair>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Require a signed offer from `sender`.
    #[must_use]
    pub fn expecting_sender(mut self, sender: IdentityPublicKey) -> Self {
        self.expected_sender = Some(sender);
        self
    }

    /// Reach the recipient over `profile` instead of the shared one.
    #[must_use]
    pub fn over_link(mut self, profile: LinkProfile) -> Self {
        self.link = Some(profile);
        self
    }

    /// Write the received file into `dir`.
    #[must_use]
    pub fn into_directory(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.destination = Some(Destination::Directory(dir.into()));
        self
    }
}

struct Peer {
    behavior: PeerBehavior,
    receiver: Option<JoinHandle<Result<ReceivedFile>>>,
    cancel_notices: usize,
}

/// In-memory connector for tests and demos
pub struct LoopbackConnector {
    config: Arc<FerryConfig>,
    profile: LinkProfile,
    peers: DashMap<RecipientId, Peer>,
}

impl LoopbackConnector {
    /// Connector whose links use `profile`.
    #[must_use]
    pub fn new(config: Arc<FerryConfig>, profile: LinkProfile) -> Self {
        Self {
            config,
            profile,
            peers: DashMap::new(),
        }
    }

    /// Register a reachable recipient.
    pub fn add_peer(&self, recipient: &RecipientId, behavior: PeerBehavior) {
        self.peers.insert(
            recipient.clone(),
            Peer {
                behavior,
                receiver: None,
                cancel_notices: 0,
            },
        );
    }

    /// Wait for the recipient's receiving side to finish.
    ///
    /// Returns `None` if the recipient was never connected or its result
    /// was already taken.
    pub async fn received(&self, recipient: &RecipientId) -> Option<Result<ReceivedFile>> {
        let handle = self.peers.get_mut(recipient)?.receiver.take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(FerryError::Protocol(format!("receiver task failed: {e}"))),
        })
    }

    /// Group cancellation notices delivered to `recipient`.
    #[must_use]
    pub fn cancel_notices(&self, recipient: &RecipientId) -> usize {
        self.peers.get(recipient).map_or(0, |p| p.cancel_notices)
    }

    fn behavior(&self, recipient: &RecipientId) -> Result<PeerBehavior> {
        self.peers
            .get(recipient)
            .map(|p| p.behavior.clone())
            .ok_or_else(|| {
                FerryError::Transport(TransportError::InvalidConfig(format!(
                    "no route to recipient {recipient}"
                )))
            })
    }

    fn transport(&self, channels: Vec<Arc<dyn Channel>>) -> Result<Arc<ParallelTransport>> {
        Ok(Arc::new(ParallelTransport::new(
            channels,
            self.config.transport.clone(),
        )?))
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn signal(
        &self,
        recipient: &RecipientDescriptor,
        envelope: SignalEnvelope,
    ) -> Result<Option<SignalEnvelope>> {
        let behavior = self.behavior(&recipient.id)?;
        let body = envelope.open(
            self.config.transfer.signaling_freshness(),
            SIGNALING_FUTURE_SKEW,
            behavior.expected_sender.as_ref(),
        )?;
        match body {
            SignalBody::Invite(invite) => {
                let reply = match &behavior.decline {
                    Some(reason) => SignalBody::Reject {
                        group_id: invite.group_id,
                        recipient_id: recipient.id.clone(),
                        reason: reason.clone(),
                    },
                    None => SignalBody::Join {
                        group_id: invite.group_id,
                        recipient_id: recipient.id.clone(),
                    },
                };
                debug!(recipient = %recipient.id, file = %invite.file_name, "invite answered");
                SignalEnvelope::seal(reply, behavior.identity.as_deref()).map(Some)
            }
            SignalBody::Cancel { group_id, reason } => {
                info!(
                    recipient = %recipient.id,
                    group = %group_id,
                    reason = %reason,
                    "group cancelled"
                );
                if let Some(mut peer) = self.peers.get_mut(&recipient.id) {
                    peer.cancel_notices += 1;
                }
                Ok(None)
            }
            SignalBody::Join { .. } | SignalBody::Reject { .. } => Err(FerryError::Protocol(
                "recipient-side signaling message sent by the sender".into(),
            )),
        }
    }

    async fn connect(&self, recipient: &RecipientDescriptor) -> Result<PeerLink> {
        let behavior = self.behavior(&recipient.id)?;
        let profile = behavior.link.unwrap_or(self.profile);
        let (local, remote) = duplex(self.config.transport.channel_count, profile);

        let sender = self.transport(local.dyn_channels())?;
        let receiver = self.transport(remote.dyn_channels())?;
        sender.attach_inbox(local.inbox);

        match behavior.fail_after_frames {
            Some(limit) => {
                let mut doomed: Vec<Arc<SimulatedChannel>> = local.channels.clone();
                doomed.extend(remote.channels.iter().cloned());
                let (relay_tx, relay_rx) = mpsc::unbounded_channel();
                let mut inbox = remote.inbox;
                let id = recipient.id.clone();
                tokio::spawn(async move {
                    let mut seen = 0u64;
                    while let Some(message) = inbox.recv().await {
                        seen += 1;
                        if seen > limit {
                            info!(recipient = %id, frames = limit, "cutting simulated link");
                            for channel in &doomed {
                                channel.fail();
                            }
                            break;
                        }
                        if relay_tx.send(message).is_err() {
                            break;
                        }
                    }
                });
                receiver.attach_inbox(relay_rx);
            }
            None => receiver.attach_inbox(remote.inbox),
        }

        let options = ReceiveOptions {
            config: Arc::clone(&self.config),
            identity: behavior.identity.clone(),
            expected_sender: behavior.expected_sender,
            destination: behavior.destination.unwrap_or(Destination::Memory),
        };
        let incoming = IncomingTransfer::new(PeerLink::new(receiver), options)?;
        let handle = tokio::spawn(incoming.run());
        if let Some(mut peer) = self.peers.get_mut(&recipient.id) {
            peer.receiver = Some(handle);
        }
        Ok(PeerLink::new(sender))
    }
}

impl std::fmt::Debug for LoopbackConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnector")
            .field("profile", &self.profile)
            .field("peers", &self.peers.len())
            .finish()
    }
}
