//! Sending side of one recipient's transfer.
//!
//! A [`RecipientSession`] owns a triple-ratchet session, a [`PeerLink`] and
//! its progress channel. Lifecycle:
//!
//! ```text
//! Pending ─► Negotiating ─► Ready ─► Transferring ─► Completed
//!    │            │           │            │
//!    └────────────┴───────────┴────────────┴──► Failed / Cancelled
//! ```
//!
//! Any cryptographic, integrity or transport error is terminal: the
//! ratchet state is wiped and the session never encrypts again.

use crate::bandwidth::Pacer;
use crate::config::{FerryConfig, MAX_CHUNK_PLAINTEXT};
use crate::error::{FerryError, Result};
use crate::ids::TransferId;
use crate::link::PeerLink;
use crate::lock;
use crate::progress::{ProgressStream, RecipientProgress, RecipientStatus};
use crate::recipient::RecipientDescriptor;
use crate::source::FileSource;
use crate::wire::{
    CancelMessage, ChunkMessage, EpochAdvanceMessage, HandshakeOffer, KeyExchangeMessage,
    Manifest, SessionPayload, TransferMessage,
};
use ferry_crypto::identity::IdentityKeypair;
use ferry_crypto::{HybridInitiator, Role, TripleRatchetSession};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long a closing session waits for its cancel notice to be acknowledged
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

struct CryptoState {
    ratchet: TripleRatchetSession,
    send_sequence: u64,
    recv_sequence: u64,
}

/// One recipient's encrypted transfer session
pub struct RecipientSession {
    recipient: RecipientDescriptor,
    transfer_id: TransferId,
    config: Arc<FerryConfig>,
    identity: Option<Arc<IdentityKeypair>>,
    link: PeerLink,
    crypto: Mutex<CryptoState>,
    progress: watch::Sender<RecipientProgress>,
    cancelled: watch::Sender<bool>,
    failure: Mutex<Option<FerryError>>,
}

impl RecipientSession {
    /// New session in `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Crypto`] for an invalid ratchet configuration
    /// or if the transfer id cannot be generated.
    pub fn new(
        recipient: RecipientDescriptor,
        link: PeerLink,
        config: Arc<FerryConfig>,
        identity: Option<Arc<IdentityKeypair>>,
        file_size: u64,
    ) -> Result<Self> {
        let ratchet = TripleRatchetSession::new(Role::Initiator, config.ratchet.clone())?;
        let (progress, _) = watch::channel(RecipientProgress::new(recipient.id.clone(), file_size));
        let (cancelled, _) = watch::channel(false);
        Ok(Self {
            transfer_id: TransferId::generate()?,
            recipient,
            config,
            identity,
            link,
            crypto: Mutex::new(CryptoState {
                ratchet,
                send_sequence: 0,
                recv_sequence: 0,
            }),
            progress,
            cancelled,
            failure: Mutex::new(None),
        })
    }

    /// Recipient this session sends to.
    #[must_use]
    pub fn recipient(&self) -> &RecipientDescriptor {
        &self.recipient
    }

    /// Transfer id used on the wire.
    #[must_use]
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RecipientStatus {
        self.progress.borrow().status
    }

    /// Latest progress snapshot.
    #[must_use]
    pub fn progress(&self) -> RecipientProgress {
        self.progress.borrow().clone()
    }

    /// Subscribe to progress changes.
    #[must_use]
    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream::new(self.progress.subscribe())
    }

    /// Error that terminated the session, if any.
    #[must_use]
    pub fn failure(&self) -> Option<FerryError> {
        lock(&self.failure).clone()
    }

    /// Current sending epoch, once keys exist.
    #[must_use]
    pub fn send_epoch(&self) -> Option<u64> {
        lock(&self.crypto).ratchet.send_epoch()
    }

    /// Transport carrying this session.
    #[must_use]
    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    /// Run the hybrid handshake and initialize the ratchet.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::KeyExchange`] if the peer rejects, answers
    /// with invalid keys or fails identity verification, and
    /// [`FerryError::Timeout`] if it does not answer in time. The session
    /// is terminal after any error.
    pub async fn start_key_exchange(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.status() != RecipientStatus::Pending {
            return Err(FerryError::validation("key exchange already started"));
        }
        self.set_status(RecipientStatus::Negotiating);
        let result = self.key_exchange().await;
        self.settle(result)
    }

    async fn key_exchange(&self) -> Result<()> {
        let (initiator, offer) = HybridInitiator::initiate();
        let parameters = lock(&self.crypto).ratchet.local_parameters().clone();
        let handshake = HandshakeOffer::new(
            self.transfer_id,
            offer,
            parameters,
            self.identity.as_deref(),
        );
        self.with_cancel(
            self.link
                .send(&TransferMessage::KeyExchange(KeyExchangeMessage::Offer(handshake.clone()))),
        )
        .await?;

        let timeout = self.config.transfer.key_exchange_timeout();
        let reply = self
            .with_cancel(self.link.recv_timeout(timeout, "key exchange"))
            .await?;
        match reply {
            TransferMessage::KeyExchange(KeyExchangeMessage::Accept(accept)) => {
                accept.verify(&handshake, self.recipient.identity.as_ref())?;
                let secret = initiator.complete(&accept.response)?;
                lock(&self.crypto)
                    .ratchet
                    .init_session(&secret, &accept.parameters)?;
                self.set_status(RecipientStatus::Ready);
                info!(
                    recipient = %self.recipient.id,
                    transfer = %self.transfer_id,
                    "key exchange complete"
                );
                Ok(())
            }
            TransferMessage::KeyExchange(KeyExchangeMessage::Reject { reason, .. }) => {
                let reason = format!("rejected by peer: {reason}");
                Err(FerryError::KeyExchange(reason))
            }
            TransferMessage::Cancel(cancel) => Err(FerryError::Cancelled(format!(
                "peer cancelled: {}",
                cancel.reason
            ))),
            other => Err(FerryError::Protocol(format!(
                "unexpected {} during key exchange",
                other.kind()
            ))),
        }
    }

    /// Stream `source` to the recipient, running the handshake first if it
    /// has not happened yet. Returns immediately with a progress stream.
    pub fn send_file(self: &Arc<Self>, source: FileSource) -> ProgressStream {
        let stream = self.subscribe();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut pacer = Pacer::unlimited();
            if let Err(e) = session.transfer(&source, &mut pacer).await {
                debug!(recipient = %session.recipient.id, error = %e, "transfer ended with error");
            }
        });
        stream
    }

    /// Handshake if needed, then send the file and wait for the receipt.
    ///
    /// # Errors
    ///
    /// Any error from [`Self::start_key_exchange`] or [`Self::run`].
    pub async fn transfer(&self, source: &FileSource, pacer: &mut Pacer) -> Result<()> {
        if self.status() == RecipientStatus::Pending {
            self.start_key_exchange().await?;
        }
        self.run(source, pacer).await
    }

    /// Send the manifest, every chunk and the end marker, then wait for the
    /// recipient's verification receipt.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] if the handshake has not completed.
    /// Every other error is terminal.
    pub async fn run(&self, source: &FileSource, pacer: &mut Pacer) -> Result<()> {
        self.ensure_usable()?;
        if self.status() != RecipientStatus::Ready {
            return Err(FerryError::validation(format!(
                "cannot send while {}",
                self.status()
            )));
        }
        let result = self.stream_file(source, pacer).await;
        self.settle(result)
    }

    async fn stream_file(&self, source: &FileSource, pacer: &mut Pacer) -> Result<()> {
        self.set_status(RecipientStatus::Transferring);
        let file_hash = self.with_cancel(source.digest()).await?;
        let file_size = source.len();
        self.send_payload(SessionPayload::Manifest(Manifest {
            file_name: source.name().to_string(),
            file_size,
            file_hash,
        }))
        .await?;

        let mut offset = 0u64;
        let mut chunks = 0u64;
        while offset < file_size {
            self.ensure_usable()?;
            self.poll_peer()?;

            let chunk_len = self
                .link
                .transport()
                .recommended_chunk_size()
                .min(MAX_CHUNK_PLAINTEXT);
            let bytes = self
                .with_cancel(source.read_range(offset, chunk_len))
                .await?;
            if bytes.is_empty() {
                return Err(FerryError::Io(format!(
                    "{} ended at {offset} of {file_size} bytes",
                    source.name()
                )));
            }
            self.with_cancel(async {
                pacer.acquire(bytes.len()).await;
                Ok::<(), FerryError>(())
            })
            .await?;

            let len = bytes.len() as u64;
            self.send_payload(SessionPayload::Data { offset, bytes })
                .await?;
            offset += len;
            chunks += 1;
            self.progress.send_modify(|p| p.bytes_sent = offset);
        }

        self.send_payload(SessionPayload::End {
            chunks,
            bytes: offset,
        })
        .await?;
        self.with_cancel(self.link.flush()).await?;
        debug!(recipient = %self.recipient.id, chunks, bytes = offset, "all chunks acknowledged");

        let timeout = self.config.transfer.receipt_timeout();
        loop {
            let message = self
                .with_cancel(self.link.recv_timeout(timeout, "receipt"))
                .await?;
            match self.process(message)? {
                None => continue,
                Some(SessionPayload::Receipt {
                    file_hash: received,
                    verified,
                }) => {
                    if !verified || received != file_hash {
                        return Err(FerryError::Integrity(format!(
                            "recipient computed {}",
                            hex::encode(&received[..8])
                        )));
                    }
                    self.finish(RecipientStatus::Completed, None);
                    info!(recipient = %self.recipient.id, bytes = offset, "transfer verified");
                    return Ok(());
                }
                Some(other) => {
                    return Err(FerryError::Protocol(format!(
                        "expected receipt, got {}",
                        payload_kind(&other)
                    )));
                }
            }
        }
    }

    /// Process one inbound message from the recipient.
    ///
    /// Returns the decrypted payload for chunk messages and `None` for
    /// epoch advances.
    ///
    /// # Errors
    ///
    /// Decryption failure, an out-of-sequence chunk or a cancel notice
    /// terminate the session.
    pub fn receive(&self, message: TransferMessage) -> Result<Option<SessionPayload>> {
        self.ensure_usable()?;
        let result = self.process(message);
        self.settle(result)
    }

    fn process(&self, message: TransferMessage) -> Result<Option<SessionPayload>> {
        if message.transfer_id() != self.transfer_id {
            return Err(FerryError::Protocol(format!(
                "message for transfer {}",
                message.transfer_id()
            )));
        }
        match message {
            TransferMessage::Chunk(chunk) => {
                let mut crypto = lock(&self.crypto);
                if chunk.sequence != crypto.recv_sequence {
                    return Err(FerryError::Protocol(format!(
                        "chunk {} out of sequence, expected {}",
                        chunk.sequence, crypto.recv_sequence
                    )));
                }
                let aad = ChunkMessage::associated_data(&self.transfer_id, chunk.sequence);
                let plaintext = crypto.ratchet.decrypt(&chunk.message, &aad)?;
                crypto.recv_sequence += 1;
                drop(crypto);
                SessionPayload::decode(&plaintext).map(Some)
            }
            TransferMessage::EpochAdvance(advance) => {
                let aad = EpochAdvanceMessage::associated_data(&self.transfer_id);
                let plaintext = lock(&self.crypto).ratchet.decrypt(&advance.message, &aad)?;
                if !plaintext.is_empty() {
                    return Err(FerryError::Protocol("epoch advance carried data".into()));
                }
                Ok(None)
            }
            TransferMessage::Cancel(cancel) => Err(FerryError::Cancelled(format!(
                "peer cancelled: {}",
                cancel.reason
            ))),
            TransferMessage::KeyExchange(_) => Err(FerryError::Protocol(
                "key exchange after session start".into(),
            )),
        }
    }

    /// Force a new PQ epoch now and announce it to the recipient.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::SessionTerminated`] after cancellation or
    /// failure, [`FerryError::Crypto`] before the handshake.
    pub async fn rekey(&self) -> Result<()> {
        self.ensure_usable()?;
        let message = {
            let mut crypto = lock(&self.crypto);
            let aad = EpochAdvanceMessage::associated_data(&self.transfer_id);
            crypto.ratchet.rekey(&aad).map(|message| {
                TransferMessage::EpochAdvance(EpochAdvanceMessage {
                    transfer_id: self.transfer_id,
                    message,
                })
            })
        };
        let result = match message {
            Ok(message) => self.with_cancel(self.link.send(&message)).await,
            Err(e) => Err(e.into()),
        };
        self.settle(result)
    }

    /// Cancel the session.
    ///
    /// Keys are wiped before this returns. The recipient is notified in the
    /// background; any later operation fails with
    /// [`FerryError::SessionTerminated`].
    pub fn cancel(&self) {
        if self.cancelled.send_replace(true) {
            return;
        }
        if self.status().is_terminal() {
            return;
        }
        *lock(&self.failure) = Some(FerryError::Cancelled("cancelled locally".into()));
        self.finish(RecipientStatus::Cancelled, Some("cancelled by sender"));
        info!(recipient = %self.recipient.id, transfer = %self.transfer_id, "session cancelled");
    }

    async fn send_payload(&self, payload: SessionPayload) -> Result<()> {
        let plaintext = payload.encode()?;
        let message = {
            let mut crypto = lock(&self.crypto);
            let sequence = crypto.send_sequence;
            let aad = ChunkMessage::associated_data(&self.transfer_id, sequence);
            let message = crypto.ratchet.encrypt(&plaintext, &aad)?;
            crypto.send_sequence += 1;
            TransferMessage::Chunk(ChunkMessage {
                transfer_id: self.transfer_id,
                sequence,
                message,
            })
        };
        self.with_cancel(self.link.send(&message)).await
    }

    /// Handle anything the recipient sent while we are streaming.
    fn poll_peer(&self) -> Result<()> {
        while let Some(message) = self.link.try_recv() {
            if let Some(payload) = self.process(message?)? {
                return Err(FerryError::Protocol(format!(
                    "unexpected {} during transfer",
                    payload_kind(&payload)
                )));
            }
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if *self.cancelled.borrow() {
            return Err(FerryError::SessionTerminated);
        }
        match self.status() {
            RecipientStatus::Failed | RecipientStatus::Cancelled => {
                Err(FerryError::SessionTerminated)
            }
            _ => Ok(()),
        }
    }

    async fn with_cancel<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut cancelled = self.cancelled.subscribe();
        tokio::select! {
            biased;
            () = async {
                let _ = cancelled.wait_for(|c| *c).await;
            } => Err(FerryError::SessionTerminated),
            result = fut => result,
        }
    }

    fn set_status(&self, status: RecipientStatus) {
        self.progress.send_if_modified(|p| {
            if p.status.is_terminal() || p.status == status {
                return false;
            }
            p.status = status;
            true
        });
    }

    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() {
                self.fail(e.clone());
            }
        }
        result
    }

    fn fail(&self, error: FerryError) {
        if self.status().is_terminal() {
            return;
        }
        if error.is_attack_indicator() {
            warn!(
                recipient = %self.recipient.id,
                error = %error,
                "session failed, possible tampering"
            );
        } else {
            warn!(recipient = %self.recipient.id, error = %error, "session failed");
        }
        let (status, notify) = match &error {
            FerryError::Cancelled(_) => (RecipientStatus::Cancelled, None),
            FerryError::SessionTerminated => (RecipientStatus::Cancelled, None),
            _ => (RecipientStatus::Failed, Some("sender failed")),
        };
        *lock(&self.failure) = Some(error);
        self.finish(status, notify);
    }

    /// Enter a terminal status, wipe keys and release the transport.
    fn finish(&self, status: RecipientStatus, notify_peer: Option<&str>) {
        let transfer_id = self.transfer_id;
        lock(&self.crypto).ratchet.close();
        self.progress.send_if_modified(|p| {
            if p.status.is_terminal() {
                return false;
            }
            p.status = status;
            true
        });

        let transport = Arc::clone(self.link.transport());
        let notice = notify_peer.and_then(|reason| {
            TransferMessage::Cancel(CancelMessage {
                transfer_id,
                reason: reason.to_string(),
            })
            .encode()
            .ok()
        });
        match (notice, tokio::runtime::Handle::try_current()) {
            (Some(bytes), Ok(handle)) => {
                handle.spawn(async move {
                    if let Err(e) = transport.send_chunk(&bytes).await {
                        debug!(transfer = %transfer_id, error = %e, "cancel notice not sent");
                    } else if !matches!(
                        tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, transport.flush()).await,
                        Ok(Ok(()))
                    ) {
                        debug!(transfer = %transfer_id, "cancel notice not acknowledged");
                    }
                    transport.close();
                });
            }
            _ => transport.close(),
        }
    }
}

fn payload_kind(payload: &SessionPayload) -> &'static str {
    match payload {
        SessionPayload::Manifest(_) => "manifest",
        SessionPayload::Data { .. } => "data",
        SessionPayload::End { .. } => "end",
        SessionPayload::Receipt { .. } => "receipt",
    }
}

impl std::fmt::Debug for RecipientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientSession")
            .field("recipient", &self.recipient.id)
            .field("transfer_id", &self.transfer_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
