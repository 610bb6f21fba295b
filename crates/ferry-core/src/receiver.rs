//! Receiving side of a transfer.
//!
//! [`IncomingTransfer`] answers the sender's handshake, decrypts the
//! payload stream in strict sequence order, writes the file under a
//! sanitized name and sends back an encrypted receipt with the hash it
//! computed. Anything unexpected ends the transfer and removes the
//! partial file.

use crate::config::FerryConfig;
use crate::error::{FerryError, Result};
use crate::ids::TransferId;
use crate::link::PeerLink;
use crate::sanitize::sanitize_filename;
use crate::wire::{
    CancelMessage, ChunkMessage, EpochAdvanceMessage, HandshakeAccept, KeyExchangeMessage,
    Manifest, SessionPayload, TransferMessage,
};
use ferry_crypto::identity::{IdentityKeypair, IdentityPublicKey};
use ferry_crypto::{Role, TripleRatchetSession, hybrid};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Preallocation cap for in-memory sinks
const MEMORY_RESERVE_LIMIT: u64 = 64 * 1024 * 1024;

/// Numbered alternatives tried when the target name exists
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Time allowed for the receipt to be acknowledged
const RECEIPT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Where received data goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Keep the file in memory
    Memory,
    /// Write into this directory
    Directory(PathBuf),
}

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Engine configuration (ratchet, timeouts, size limit)
    pub config: Arc<FerryConfig>,
    /// Our identity, used to sign the handshake acceptance
    pub identity: Option<Arc<IdentityKeypair>>,
    /// Required sender identity
    pub expected_sender: Option<IdentityPublicKey>,
    /// Output location
    pub destination: Destination,
}

impl ReceiveOptions {
    /// Defaults: in memory, no identities.
    #[must_use]
    pub fn new(config: Arc<FerryConfig>) -> Self {
        Self {
            config,
            identity: None,
            expected_sender: None,
            destination: Destination::Memory,
        }
    }
}

/// Received file contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedData {
    /// Bytes held in memory
    Memory(Vec<u8>),
    /// Path of the written file
    Disk(PathBuf),
}

/// A verified, complete file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Transfer
    pub transfer_id: TransferId,
    /// Sanitized file name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// BLAKE3 hash, equal to the manifest's
    pub hash: [u8; 32],
    /// Contents
    pub data: ReceivedData,
}

enum Sink {
    Memory(Vec<u8>),
    Disk { path: PathBuf, file: File },
}

impl Sink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Memory(buf) => buf.extend_from_slice(bytes),
            Self::Disk { file, .. } => file.write_all(bytes).await?,
        }
        Ok(())
    }

    async fn finish(self) -> Result<ReceivedData> {
        match self {
            Self::Memory(buf) => Ok(ReceivedData::Memory(buf)),
            Self::Disk { path, mut file } => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(ReceivedData::Disk(path))
            }
        }
    }

    async fn discard(self) {
        if let Self::Disk { path, file } = self {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not remove partial file");
            }
        }
    }
}

struct Receiving {
    manifest: Manifest,
    name: String,
    sink: Sink,
    hasher: blake3::Hasher,
    received: u64,
    chunks: u64,
}

/// Receiving end of one transfer
pub struct IncomingTransfer {
    link: PeerLink,
    options: ReceiveOptions,
    ratchet: TripleRatchetSession,
    transfer_id: Option<TransferId>,
    send_sequence: u64,
    recv_sequence: u64,
}

impl IncomingTransfer {
    /// Prepare to receive over `link`.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Crypto`] for an invalid ratchet configuration.
    pub fn new(link: PeerLink, options: ReceiveOptions) -> Result<Self> {
        let ratchet = TripleRatchetSession::new(Role::Responder, options.config.ratchet.clone())?;
        Ok(Self {
            link,
            options,
            ratchet,
            transfer_id: None,
            send_sequence: 0,
            recv_sequence: 0,
        })
    }

    /// Transfer id, once the offer has arrived.
    #[must_use]
    pub fn transfer_id(&self) -> Option<TransferId> {
        self.transfer_id
    }

    /// Handshake, then receive the whole file.
    ///
    /// # Errors
    ///
    /// Any handshake, decryption, protocol, I/O or integrity failure. The
    /// sender is told about the failure when possible.
    pub async fn run(mut self) -> Result<ReceivedFile> {
        let result = match self.accept().await {
            Ok(()) => self.receive_file().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    /// Answer the sender's offer.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::KeyExchange`] for an offer that fails identity
    /// verification or carries invalid keys; the sender receives a reject.
    pub async fn accept(&mut self) -> Result<()> {
        let timeout = self.options.config.transfer.key_exchange_timeout();
        let first = self.link.recv_timeout(timeout, "offer").await?;
        let offer = match first {
            TransferMessage::KeyExchange(KeyExchangeMessage::Offer(offer)) => offer,
            other => {
                return Err(FerryError::Protocol(format!(
                    "expected offer, got {}",
                    other.kind()
                )));
            }
        };
        self.transfer_id = Some(offer.transfer_id);

        let verified = offer
            .verify(self.options.expected_sender.as_ref())
            .and_then(|()| Ok(hybrid::respond(&offer.offer)?))
            .and_then(|(secret, response)| {
                self.ratchet.init_session(&secret, &offer.parameters)?;
                Ok(response)
            });
        let response = match verified {
            Ok(response) => response,
            Err(e) => {
                warn!(transfer = %offer.transfer_id, error = %e, "rejecting offer");
                let reject = TransferMessage::KeyExchange(KeyExchangeMessage::Reject {
                    transfer_id: offer.transfer_id,
                    reason: e.to_string(),
                });
                if let Err(send_err) = self.link.send(&reject).await {
                    debug!(
                        transfer = %offer.transfer_id,
                        error = %send_err,
                        "reject not delivered"
                    );
                }
                return Err(e);
            }
        };

        let accept = HandshakeAccept::new(
            &offer,
            response,
            self.ratchet.local_parameters().clone(),
            self.options.identity.as_deref(),
        );
        self.link
            .send(&TransferMessage::KeyExchange(KeyExchangeMessage::Accept(accept)))
            .await?;
        debug!(transfer = %offer.transfer_id, "offer accepted");
        Ok(())
    }

    async fn receive_file(&mut self) -> Result<ReceivedFile> {
        let transfer_id = self.require_transfer_id()?;
        let idle = self.options.config.transfer.receipt_timeout();
        let mut state: Option<Receiving> = None;

        let result = loop {
            let message = match self.link.recv_timeout(idle, "sender data").await {
                Ok(message) => message,
                Err(e) => break Err(e),
            };
            let payload = match self.open(message) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => break Err(e),
            };
            match self.apply(payload, &mut state).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        let Some(receiving) = state else {
            let empty = Err(FerryError::Protocol("transfer ended without data".into()));
            return result.and(empty);
        };
        if let Err(e) = result {
            receiving.sink.discard().await;
            return Err(e);
        }

        let hash: [u8; 32] = receiving.hasher.finalize().into();
        let verified = hash == receiving.manifest.file_hash;
        self.send(SessionPayload::Receipt {
            file_hash: hash,
            verified,
        })
        .await?;
        // The sender closes the link once it has the receipt.
        match tokio::time::timeout(RECEIPT_FLUSH_TIMEOUT, self.link.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(transfer = %transfer_id, error = %e, "receipt flush failed"),
            Err(_) => debug!(transfer = %transfer_id, "receipt not acknowledged in time"),
        }

        if !verified {
            receiving.sink.discard().await;
            return Err(FerryError::Integrity(format!(
                "{} hash mismatch",
                receiving.name
            )));
        }
        let data = receiving.sink.finish().await?;
        info!(
            transfer = %transfer_id,
            name = %receiving.name,
            bytes = receiving.received,
            chunks = receiving.chunks,
            "file received and verified"
        );
        Ok(ReceivedFile {
            transfer_id,
            name: receiving.name,
            size: receiving.received,
            hash,
            data,
        })
    }

    /// Apply one payload; returns `true` after the end marker.
    async fn apply(&self, payload: SessionPayload, state: &mut Option<Receiving>) -> Result<bool> {
        match (payload, state.as_mut()) {
            (SessionPayload::Manifest(manifest), None) => {
                if manifest.file_size == 0 {
                    return Err(FerryError::Protocol("empty file announced".into()));
                }
                if manifest.file_size > self.options.config.transfer.max_file_size {
                    return Err(FerryError::validation(format!(
                        "file of {} bytes exceeds limit",
                        manifest.file_size
                    )));
                }
                let name = sanitize_filename(&manifest.file_name);
                let sink = self.open_sink(&name, manifest.file_size).await?;
                debug!(name = %name, size = manifest.file_size, "manifest received");
                *state = Some(Receiving {
                    manifest,
                    name,
                    sink,
                    hasher: blake3::Hasher::new(),
                    received: 0,
                    chunks: 0,
                });
                Ok(false)
            }
            (SessionPayload::Data { offset, bytes }, Some(rx)) => {
                if offset != rx.received {
                    return Err(FerryError::Protocol(format!(
                        "data at {offset}, expected {}",
                        rx.received
                    )));
                }
                let end = rx.received.saturating_add(bytes.len() as u64);
                if end > rx.manifest.file_size {
                    return Err(FerryError::Protocol("data beyond announced size".into()));
                }
                rx.hasher.update(&bytes);
                rx.sink.write(&bytes).await?;
                rx.received = end;
                rx.chunks += 1;
                Ok(false)
            }
            (SessionPayload::End { chunks, bytes }, Some(rx)) => {
                if chunks != rx.chunks || bytes != rx.received || bytes != rx.manifest.file_size {
                    return Err(FerryError::Integrity(format!(
                        "end marker says {chunks} chunks/{bytes} bytes, got {}/{} of {}",
                        rx.chunks, rx.received, rx.manifest.file_size
                    )));
                }
                Ok(true)
            }
            (SessionPayload::Manifest(_), Some(_)) => {
                Err(FerryError::Protocol("second manifest".into()))
            }
            (SessionPayload::Receipt { .. }, _) => {
                Err(FerryError::Protocol("receipt sent to receiver".into()))
            }
            (_, None) => Err(FerryError::Protocol("data before manifest".into())),
        }
    }

    fn open(&mut self, message: TransferMessage) -> Result<Option<SessionPayload>> {
        let transfer_id = self.require_transfer_id()?;
        if message.transfer_id() != transfer_id {
            return Err(FerryError::Protocol(format!(
                "message for transfer {}",
                message.transfer_id()
            )));
        }
        match message {
            TransferMessage::Chunk(chunk) => {
                if chunk.sequence != self.recv_sequence {
                    return Err(FerryError::Protocol(format!(
                        "chunk {} out of sequence, expected {}",
                        chunk.sequence, self.recv_sequence
                    )));
                }
                let aad = ChunkMessage::associated_data(&transfer_id, chunk.sequence);
                let plaintext = self.ratchet.decrypt(&chunk.message, &aad)?;
                self.recv_sequence += 1;
                SessionPayload::decode(&plaintext).map(Some)
            }
            TransferMessage::EpochAdvance(advance) => {
                let aad = EpochAdvanceMessage::associated_data(&transfer_id);
                let plaintext = self.ratchet.decrypt(&advance.message, &aad)?;
                if !plaintext.is_empty() {
                    return Err(FerryError::Protocol("epoch advance carried data".into()));
                }
                debug!(
                    transfer = %transfer_id,
                    epoch = ?self.ratchet.recv_epoch(),
                    "sender advanced epoch"
                );
                Ok(None)
            }
            TransferMessage::Cancel(cancel) => Err(FerryError::Cancelled(format!(
                "sender cancelled: {}",
                cancel.reason
            ))),
            TransferMessage::KeyExchange(_) => {
                let message = "key exchange after session start";
                Err(FerryError::Protocol(message.into()))
            }
        }
    }

    async fn send(&mut self, payload: SessionPayload) -> Result<()> {
        let transfer_id = self.require_transfer_id()?;
        let sequence = self.send_sequence;
        let aad = ChunkMessage::associated_data(&transfer_id, sequence);
        let message = self.ratchet.encrypt(&payload.encode()?, &aad)?;
        self.send_sequence += 1;
        self.link
            .send(&TransferMessage::Chunk(ChunkMessage {
                transfer_id,
                sequence,
                message,
            }))
            .await
    }

    async fn open_sink(&self, name: &str, size: u64) -> Result<Sink> {
        match &self.options.destination {
            Destination::Memory => Ok(Sink::Memory(Vec::with_capacity(
                size.min(MEMORY_RESERVE_LIMIT) as usize,
            ))),
            Destination::Directory(dir) => {
                let (path, file) = create_unique(dir, name).await?;
                Ok(Sink::Disk { path, file })
            }
        }
    }

    async fn abort(&mut self, error: &FerryError) {
        self.ratchet.close();
        if matches!(error, FerryError::Cancelled(_)) {
            self.link.close();
            return;
        }
        if let Some(transfer_id) = self.transfer_id {
            let notice = TransferMessage::Cancel(CancelMessage {
                transfer_id,
                reason: error.to_string(),
            });
            if let Err(e) = self.link.send(&notice).await {
                debug!(transfer = %transfer_id, error = %e, "cancel notice not delivered");
            }
        }
        self.link.close();
    }

    fn require_transfer_id(&self) -> Result<TransferId> {
        self.transfer_id
            .ok_or_else(|| FerryError::Protocol("no offer received".into()))
    }
}

impl std::fmt::Debug for IncomingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingTransfer")
            .field("transfer_id", &self.transfer_id)
            .field("recv_sequence", &self.recv_sequence)
            .finish_non_exhaustive()
    }
}

/// Create `name` in `dir`, or `stem (n).ext` if it is taken.
async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem} ({attempt}){ext}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FerryError::Io(format!(
        "no free name for {name} in {}",
        dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HandshakeOffer;
    use ferry_crypto::HybridInitiator;
    use ferry_transport::simulated::{LinkProfile, duplex};
    use ferry_transport::{ParallelTransport, TransportConfig};

    fn link_pair() -> (PeerLink, PeerLink) {
        let (a, b) = duplex(2, LinkProfile::ideal());
        let ta = Arc::new(
            ParallelTransport::new(a.dyn_channels(), TransportConfig::default()).unwrap(),
        );
        let tb = Arc::new(
            ParallelTransport::new(b.dyn_channels(), TransportConfig::default()).unwrap(),
        );
        ta.attach_inbox(a.inbox);
        tb.attach_inbox(b.inbox);
        (PeerLink::new(ta), PeerLink::new(tb))
    }

    /// Run the sender half of the handshake by hand against `incoming`.
    async fn handshake(
        sender: &PeerLink,
        incoming: &mut IncomingTransfer,
        transfer_id: TransferId,
    ) -> TripleRatchetSession {
        let config = FerryConfig::default();
        let mut ratchet = TripleRatchetSession::new(Role::Initiator, config.ratchet).unwrap();
        let (initiator, offer) = HybridInitiator::initiate();
        let offer =
            HandshakeOffer::new(transfer_id, offer, ratchet.local_parameters().clone(), None);
        sender
            .send(&TransferMessage::KeyExchange(KeyExchangeMessage::Offer(offer)))
            .await
            .unwrap();
        incoming.accept().await.unwrap();

        let TransferMessage::KeyExchange(KeyExchangeMessage::Accept(accept)) =
            sender.recv().await.unwrap()
        else {
            panic!("expected accept");
        };
        let secret = initiator.complete(&accept.response).unwrap();
        ratchet.init_session(&secret, &accept.parameters).unwrap();
        ratchet
    }

    #[tokio::test]
    async fn test_epoch_advance_with_payload_is_rejected() {
        let (sender, receiver) = link_pair();
        let options = ReceiveOptions::new(Arc::new(FerryConfig::default()));
        let mut incoming = IncomingTransfer::new(receiver, options).unwrap();
        let transfer_id = TransferId::from_bytes([7; 16]);
        let mut ratchet = handshake(&sender, &mut incoming, transfer_id).await;

        let aad = EpochAdvanceMessage::associated_data(&transfer_id);
        let message = ratchet.encrypt(b"smuggled bytes", &aad).unwrap();
        sender
            .send(&TransferMessage::EpochAdvance(EpochAdvanceMessage {
                transfer_id,
                message,
            }))
            .await
            .unwrap();

        let err = incoming.receive_file().await.unwrap_err();
        assert!(matches!(err, FerryError::Protocol(ref m) if m.contains("epoch advance")));
    }

    #[tokio::test]
    async fn test_empty_epoch_advance_is_accepted() {
        let (sender, receiver) = link_pair();
        let options = ReceiveOptions::new(Arc::new(FerryConfig::default()));
        let mut incoming = IncomingTransfer::new(receiver, options).unwrap();
        let transfer_id = TransferId::from_bytes([8; 16]);
        let mut ratchet = handshake(&sender, &mut incoming, transfer_id).await;

        let aad = EpochAdvanceMessage::associated_data(&transfer_id);
        let message = ratchet.rekey(&aad).unwrap();
        let opened = incoming
            .open(TransferMessage::EpochAdvance(EpochAdvanceMessage {
                transfer_id,
                message,
            }))
            .unwrap();
        assert!(opened.is_none());
        assert_eq!(incoming.ratchet.recv_epoch(), Some(1));
    }

    #[tokio::test]
    async fn test_undeliverable_reject_keeps_verification_error() {
        let (sender, receiver) = link_pair();
        let mut options = ReceiveOptions::new(Arc::new(FerryConfig::default()));
        options.expected_sender = Some(IdentityKeypair::generate().public_key());
        let mut incoming = IncomingTransfer::new(receiver, options).unwrap();
        let transfer_id = TransferId::from_bytes([9; 16]);

        let ratchet = TripleRatchetSession::new(Role::Initiator, Default::default()).unwrap();
        let (_initiator, offer) = HybridInitiator::initiate();
        let offer =
            HandshakeOffer::new(transfer_id, offer, ratchet.local_parameters().clone(), None);
        sender
            .send(&TransferMessage::KeyExchange(KeyExchangeMessage::Offer(offer)))
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), sender.flush()).await;
        sender.close();

        let result = tokio::time::timeout(Duration::from_secs(5), incoming.accept())
            .await
            .expect("accept returns once the reject is attempted");
        assert!(matches!(result, Err(FerryError::KeyExchange(ref m)) if m.contains("not signed")));
        assert_eq!(incoming.transfer_id(), Some(transfer_id));
    }

    #[tokio::test]
    async fn test_create_unique_numbers_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = create_unique(dir.path(), "report.pdf").await.unwrap();
        let (second, _) = create_unique(dir.path(), "report.pdf").await.unwrap();
        let (third, _) = create_unique(dir.path(), "report.pdf").await.unwrap();
        assert_eq!(first, dir.path().join("report.pdf"));
        assert_eq!(second, dir.path().join("report (1).pdf"));
        assert_eq!(third, dir.path().join("report (2).pdf"));
    }

    #[tokio::test]
    async fn test_create_unique_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        create_unique(dir.path(), "notes").await.unwrap();
        let (second, _) = create_unique(dir.path(), "notes").await.unwrap();
        assert_eq!(second, dir.path().join("notes (1)"));
    }

    #[tokio::test]
    async fn test_disk_sink_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = create_unique(dir.path(), "partial.bin").await.unwrap();
        let mut sink = Sink::Disk {
            path: path.clone(),
            file,
        };
        sink.write(b"half").await.unwrap();
        sink.discard().await;
        assert!(!path.exists());
    }
}
