//! Parallel channel transport.
//!
//! [`ParallelTransport`] turns a set of unordered, lossy channels into one
//! reliable, ordered stream of payloads:
//!
//! - Outgoing payloads get a sequence number and go to the next open
//!   channel in round-robin order. Channels above their high watermark are
//!   skipped until they drain below the low watermark; when every channel is
//!   paused the sender waits.
//! - The receiver reassembles in sequence order, acknowledges cumulatively
//!   and requests retransmission of gaps.
//! - The sender keeps unacknowledged frames, retransmits on NACK or ack
//!   timeout, and feeds RTT and loss into the adaptive chunk sizer.

use crate::backpressure::{BackpressureGate, FlowState, Watermarks};
use crate::channel::{Channel, ChannelId};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::frame::{Frame, FrameType};
use crate::reassembly::Reassembler;
use crate::retransmit::RetransmitBuffer;
use crate::simulated::InboxReceiver;
use crate::sizing::AdaptiveChunkSizer;
use crate::{MAX_CHANNELS, MIN_CHANNELS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback for in-order payloads.
///
/// Invoked from the receive path while reassembly state is locked, so it
/// must not call back into the same transport's receive side.
pub type ReceiveHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Payload bytes accepted by `send_chunk`
    pub bytes_sent: u64,
    /// Payload bytes delivered in order
    pub bytes_received: u64,
    /// Data frames put on a channel, retransmissions included
    pub frames_sent: u64,
    /// Data frames taken off a channel, duplicates included
    pub frames_received: u64,
    /// Frames sent again after a NACK or ack timeout
    pub retransmissions: u64,
    /// Times a sender found every channel paused
    pub backpressure_waits: u64,
    /// Channel send failures
    pub send_errors: u64,
    /// Undecodable inbound frames
    pub recv_errors: u64,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    retransmissions: AtomicU64,
    backpressure_waits: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

struct ChannelSlot {
    channel: Arc<dyn Channel>,
    gate: Mutex<BackpressureGate>,
}

impl ChannelSlot {
    fn flow(&self) -> FlowState {
        lock(&self.gate).observe(self.channel.buffered_amount())
    }
}

struct SendState {
    next_sequence: u64,
    unacked: RetransmitBuffer,
}

struct RecvState {
    reassembler: Reassembler,
    handler: Option<ReceiveHandler>,
    backlog: VecDeque<Vec<u8>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reliable ordered transport over 2-4 parallel channels
pub struct ParallelTransport {
    config: TransportConfig,
    slots: Vec<ChannelSlot>,
    cursor: AtomicUsize,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    acked: Notify,
    sizer: Mutex<AdaptiveChunkSizer>,
    counters: Counters,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ParallelTransport {
    /// Build a transport over `channels`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for an invalid
    /// configuration or a channel count outside 2-4.
    pub fn new(channels: Vec<Arc<dyn Channel>>, config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&channels.len()) {
            return Err(TransportError::InvalidConfig(format!(
                "expected {MIN_CHANNELS}-{MAX_CHANNELS} channels, got {}",
                channels.len()
            )));
        }
        let watermarks: Watermarks = config.watermarks()?;

        Ok(Self {
            slots: channels
                .into_iter()
                .map(|channel| ChannelSlot {
                    channel,
                    gate: Mutex::new(BackpressureGate::new(watermarks)),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            send: Mutex::new(SendState {
                next_sequence: 0,
                unacked: RetransmitBuffer::new(config.retransmit_capacity),
            }),
            recv: Mutex::new(RecvState {
                reassembler: Reassembler::new(config.reassembly_window),
                handler: None,
                backlog: VecDeque::new(),
            }),
            acked: Notify::new(),
            sizer: Mutex::new(AdaptiveChunkSizer::new(config.sizing.clone())),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            config,
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Number of channels, closed ones included.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    /// Channels still open.
    #[must_use]
    pub fn live_channels(&self) -> usize {
        self.slots.iter().filter(|s| !s.channel.is_closed()).count()
    }

    /// Whether the transport can no longer send.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.live_channels() == 0
    }

    /// Send one payload; returns its sequence number.
    ///
    /// Returns once a channel has accepted the frame. Delivery is confirmed
    /// asynchronously; use [`flush`](Self::flush) to wait for it.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] after [`close`](Self::close)
    /// - [`TransportError::AllChannelsFailed`] when no channel is left
    /// - [`TransportError::SendTimeout`] when channels never drain or the
    ///   peer stops acknowledging within the retry budget
    pub async fn send_chunk(&self, payload: &[u8]) -> TransportResult<u64> {
        let mut timeouts = 0u32;
        let (sequence, encoded) = loop {
            self.ensure_open()?;
            let acked = self.acked.notified();
            {
                let mut send = lock(&self.send);
                if send.unacked.has_room() {
                    let sequence = send.next_sequence;
                    let encoded = Frame::data(sequence, payload.to_vec()).encode()?;
                    send.next_sequence += 1;
                    send.unacked
                        .insert(sequence, encoded.clone(), Instant::now());
                    break (sequence, encoded);
                }
            }
            if tokio::time::timeout(self.config.ack_timeout(), acked)
                .await
                .is_err()
            {
                timeouts += 1;
                if timeouts > self.config.max_send_retries {
                    return Err(TransportError::SendTimeout { attempts: timeouts });
                }
                self.retransmit_expired().await?;
            }
        };

        let channel = self.dispatch(&encoded).await?;
        Counters::bump(&self.counters.bytes_sent, payload.len() as u64);
        trace!(sequence, channel, len = payload.len(), "chunk sent");
        Ok(sequence)
    }

    /// Wait until every sent payload has been acknowledged.
    ///
    /// # Errors
    ///
    /// Same as [`send_chunk`](Self::send_chunk).
    pub async fn flush(&self) -> TransportResult<()> {
        let mut timeouts = 0u32;
        loop {
            self.ensure_open()?;
            let acked = self.acked.notified();
            if lock(&self.send).unacked.is_empty() {
                return Ok(());
            }
            if tokio::time::timeout(self.config.ack_timeout(), acked)
                .await
                .is_err()
            {
                timeouts += 1;
                if timeouts > self.config.max_send_retries {
                    return Err(TransportError::SendTimeout { attempts: timeouts });
                }
                self.retransmit_expired().await?;
            }
        }
    }

    /// Process one message that arrived on `channel`.
    ///
    /// Normally driven by [`attach_inbox`](Self::attach_inbox); exposed so
    /// custom substrates can feed frames directly.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Frame`] for a malformed frame. The frame is
    /// discarded and the transport stays usable.
    pub async fn handle_inbound(&self, channel: ChannelId, bytes: &[u8]) -> TransportResult<()> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                Counters::bump(&self.counters.recv_errors, 1);
                warn!(channel, error = %e, "discarding malformed frame");
                return Err(e.into());
            }
        };

        match frame.frame_type {
            FrameType::Data => self.on_data(frame.sequence, frame.payload).await,
            FrameType::Ack => {
                self.on_ack(frame.sequence);
                Ok(())
            }
            FrameType::Nack => self.on_nack(frame.sequence).await,
        }
    }

    /// Register the in-order payload handler.
    ///
    /// Payloads that arrived before a handler was set are delivered to it
    /// immediately, in order.
    pub fn on_receive(&self, handler: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        let handler: ReceiveHandler = Arc::new(handler);
        let mut recv = lock(&self.recv);
        while let Some(payload) = recv.backlog.pop_front() {
            handler(payload);
        }
        recv.handler = Some(handler);
    }

    /// Spawn a task that feeds `inbox` into [`handle_inbound`](Self::handle_inbound).
    ///
    /// The task holds a weak reference and stops once the transport is
    /// dropped or closed, or the inbox ends.
    pub fn attach_inbox(self: &Arc<Self>, mut inbox: InboxReceiver) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some((channel, bytes)) = inbox.recv().await {
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                if transport.closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = transport.handle_inbound(channel, &bytes).await {
                    debug!(channel, error = %e, "inbound frame rejected");
                }
            }
        });
        if let Some(previous) = lock(&self.reader).replace(task) {
            previous.abort();
        }
    }

    /// Fraction of total buffer capacity in use across open channels, `0.0..=1.0`.
    ///
    /// Capacity is the high watermark per open channel. A transport with
    /// no open channel reports `1.0`.
    #[must_use]
    pub fn buffer_level(&self) -> f64 {
        let (buffered, live) = self
            .slots
            .iter()
            .filter(|s| !s.channel.is_closed())
            .fold((0usize, 0usize), |(b, n), s| {
                (b + s.channel.buffered_amount(), n + 1)
            });
        if live == 0 {
            return 1.0;
        }
        let capacity = (self.config.high_watermark * live) as f64;
        (buffered as f64 / capacity).min(1.0)
    }

    /// Chunk size suited to current RTT and loss.
    #[must_use]
    pub fn recommended_chunk_size(&self) -> usize {
        lock(&self.sizer).recommended()
    }

    /// Smoothed RTT, once measured.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        lock(&self.sizer).smoothed_rtt()
    }

    /// Frames sent but not yet acknowledged.
    #[must_use]
    pub fn unacked(&self) -> usize {
        lock(&self.send).unacked.len()
    }

    /// Times each channel has been paused by backpressure.
    #[must_use]
    pub fn pause_counts(&self) -> Vec<u64> {
        self.slots.iter().map(|s| lock(&s.gate).pauses()).collect()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    /// Close every channel and stop the reader task. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            slot.channel.close();
        }
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
        self.acked.notify_waiters();
        debug!(channels = self.slots.len(), "transport closed");
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.live_channels() == 0 {
            return Err(TransportError::AllChannelsFailed(self.slots.len()));
        }
        Ok(())
    }

    /// Next open, unpaused channel in round-robin order.
    fn next_open_slot(&self) -> Option<&ChannelSlot> {
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.slots[(start + i) % n])
            .find(|slot| !slot.channel.is_closed() && slot.flow() == FlowState::Open)
    }

    /// Put a data frame on a channel, waiting out backpressure.
    async fn dispatch(&self, encoded: &[u8]) -> TransportResult<ChannelId> {
        let deadline = Instant::now() + self.config.drain_timeout();
        let mut failures = 0u32;
        let mut waited = false;

        loop {
            self.ensure_open()?;

            if let Some(slot) = self.next_open_slot() {
                match slot.channel.send(encoded).await {
                    Ok(()) => {
                        slot.flow();
                        Counters::bump(&self.counters.frames_sent, 1);
                        return Ok(slot.channel.id());
                    }
                    Err(e) => {
                        Counters::bump(&self.counters.send_errors, 1);
                        warn!(channel = slot.channel.id(), error = %e, "channel send failed");
                        if slot.channel.is_closed() {
                            continue;
                        }
                        failures += 1;
                        if failures > self.config.max_send_retries {
                            return Err(e);
                        }
                        tokio::time::sleep(self.config.retry_backoff()).await;
                        continue;
                    }
                }
            }

            if !waited {
                waited = true;
                Counters::bump(&self.counters.backpressure_waits, 1);
                trace!(level = self.buffer_level(), "all channels paused");
            }
            if Instant::now() >= deadline {
                return Err(TransportError::SendTimeout {
                    attempts: failures + 1,
                });
            }
            tokio::time::sleep(self.config.drain_poll_interval()).await;
        }
    }

    /// Control frames are small and bypass backpressure; loss is recovered
    /// by the next ACK or the sender's timeout.
    async fn send_control(&self, frame: Frame) {
        let Ok(bytes) = frame.encode() else { return };
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let slot = (0..n)
            .map(|i| &self.slots[(start + i) % n])
            .find(|slot| !slot.channel.is_closed());
        if let Some(slot) = slot {
            if let Err(e) = slot.channel.send(&bytes).await {
                debug!(channel = slot.channel.id(), error = %e, "control frame not sent");
            }
        }
    }

    async fn on_data(&self, sequence: u64, payload: Vec<u8>) -> TransportResult<()> {
        Counters::bump(&self.counters.frames_received, 1);
        let (next_expected, missing) = {
            let mut recv = lock(&self.recv);
            let out = recv.reassembler.accept(sequence, payload);
            for payload in out.ready {
                Counters::bump(&self.counters.bytes_received, payload.len() as u64);
                match &recv.handler {
                    Some(handler) => handler(payload),
                    None => recv.backlog.push_back(payload),
                }
            }
            if out.duplicate {
                trace!(sequence, "duplicate frame");
            }
            (recv.reassembler.next_expected(), out.missing)
        };

        self.send_control(Frame::ack(next_expected)).await;
        if let Some(missing) = missing {
            trace!(missing, "requesting retransmission");
            self.send_control(Frame::nack(missing)).await;
        }
        Ok(())
    }

    fn on_ack(&self, next_expected: u64) {
        let sample = lock(&self.send)
            .unacked
            .acknowledge(next_expected, Instant::now());
        if let Some(rtt) = sample {
            let mut sizer = lock(&self.sizer);
            sizer.record_rtt(rtt);
            sizer.record_delivery(false);
        }
        self.acked.notify_waiters();
    }

    async fn on_nack(&self, sequence: u64) -> TransportResult<()> {
        let min_age = self
            .smoothed_rtt()
            .unwrap_or(self.config.drain_poll_interval());
        let frame = lock(&self.send)
            .unacked
            .resend(sequence, Instant::now(), min_age);
        if let Some(encoded) = frame {
            lock(&self.sizer).record_delivery(true);
            Counters::bump(&self.counters.retransmissions, 1);
            debug!(sequence, "retransmitting on NACK");
            self.dispatch(&encoded).await?;
        }
        Ok(())
    }

    /// Resend every frame unacknowledged for at least one ack timeout.
    async fn retransmit_expired(&self) -> TransportResult<()> {
        let now = Instant::now();
        let frames: Vec<Vec<u8>> = {
            let mut send = lock(&self.send);
            let pending = send.unacked.oldest(usize::MAX);
            pending
                .into_iter()
                .filter_map(|seq| send.unacked.resend(seq, now, self.config.ack_timeout()))
                .collect()
        };
        if frames.is_empty() {
            return Ok(());
        }
        lock(&self.sizer).record_delivery(true);
        debug!(count = frames.len(), "retransmitting after ack timeout");
        for encoded in frames {
            Counters::bump(&self.counters.retransmissions, 1);
            self.dispatch(&encoded).await?;
        }
        Ok(())
    }
}

impl Drop for ParallelTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ParallelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTransport")
            .field("channels", &self.slots.len())
            .field("live", &self.live_channels())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
