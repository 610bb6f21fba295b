//! Message-passing boundary between a session and its transport.
//!
//! A [`PeerLink`] owns one [`ParallelTransport`] and turns its in-order
//! payload callback into a queue of decoded [`TransferMessage`]s. Sessions
//! only ever call `send`/`recv`; the transport never sees session state.

use crate::error::{FerryError, Result};
use crate::recipient::RecipientDescriptor;
use crate::signaling::SignalEnvelope;
use crate::wire::TransferMessage;
use async_trait::async_trait;
use ferry_transport::{ParallelTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

/// One peer connection as seen by a session
pub struct PeerLink {
    transport: Arc<ParallelTransport>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl PeerLink {
    /// Wrap a transport, taking over its receive callback.
    #[must_use]
    pub fn new(transport: Arc<ParallelTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_receive(move |payload| {
            // The receiving half only goes away with the link itself.
            let _ = tx.send(payload);
        });
        Self {
            transport,
            inbound: Mutex::new(rx),
        }
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<ParallelTransport> {
        &self.transport
    }

    /// Encode and send one message.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] or [`FerryError::Transport`].
    pub async fn send(&self, message: &TransferMessage) -> Result<()> {
        let bytes = message.encode()?;
        trace!(kind = message.kind(), len = bytes.len(), "link send");
        self.transport.send_chunk(&bytes).await?;
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Serialization`] for an undecodable payload and
    /// [`FerryError::Transport`] once the link can no longer deliver.
    pub async fn recv(&self) -> Result<TransferMessage> {
        let payload = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(FerryError::Transport(TransportError::Closed))?;
        TransferMessage::decode(&payload)
    }

    /// [`Self::recv`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Timeout`] naming `what` when nothing arrives.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
        what: &'static str,
    ) -> Result<TransferMessage> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| FerryError::Timeout(what))?
    }

    /// Next message if one is already queued.
    pub fn try_recv(&self) -> Option<Result<TransferMessage>> {
        let mut inbound = self.inbound.try_lock().ok()?;
        inbound
            .try_recv()
            .ok()
            .map(|payload| TransferMessage::decode(&payload))
    }

    /// Wait until everything sent has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Transport`] on failure or timeout.
    pub async fn flush(&self) -> Result<()> {
        self.transport.flush().await?;
        Ok(())
    }

    /// Close the transport.
    pub fn close(&self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// External collaborator that reaches recipients.
///
/// Covers the signaling channel and transport setup, both outside the
/// engine's scope.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Deliver a signaling message to `recipient`; returns its reply, if
    /// the message expects one.
    async fn signal(
        &self,
        recipient: &RecipientDescriptor,
        envelope: SignalEnvelope,
    ) -> Result<Option<SignalEnvelope>>;

    /// Open a transport connection to `recipient`.
    async fn connect(&self, recipient: &RecipientDescriptor) -> Result<PeerLink>;
}
