//! In-memory channels for tests, demos and benchmarks.
//!
//! Two modes are provided:
//! - **Pumped**: a background task drains the queue at the link's
//!   bandwidth, then delivers each message after latency plus jitter,
//!   dropping a fraction of them. Jitter reorders messages.
//! - **Manual**: nothing moves until the test calls [`SimulatedChannel::release`],
//!   [`SimulatedChannel::discard`] or [`SimulatedChannel::take_queued`],
//!   which makes stalls and delivery order fully deterministic.
//!
//! Pumped channels spawn onto the current tokio runtime.

use crate::channel::{Channel, ChannelId, ChannelStats};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

/// Sink that receives `(channel, message)` pairs on the far side
pub type InboxSender = mpsc::UnboundedSender<(ChannelId, Vec<u8>)>;

/// Receiving end of an inbox
pub type InboxReceiver = mpsc::UnboundedReceiver<(ChannelId, Vec<u8>)>;

/// Link characteristics for pumped channels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProfile {
    /// Serialization rate in bits per second, 0 for unlimited
    pub bandwidth_bps: u64,
    /// One-way latency
    pub latency: Duration,
    /// Maximum extra random delay per message
    pub jitter: Duration,
    /// Probability that a message is dropped
    pub loss_rate: f64,
}

impl LinkProfile {
    /// Unlimited, instantaneous, lossless.
    #[must_use]
    pub fn ideal() -> Self {
        Self {
            bandwidth_bps: 0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            loss_rate: 0.0,
        }
    }

    /// Local network: 1 Gbit/s, sub-millisecond latency.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            bandwidth_bps: 1_000_000_000,
            latency: Duration::from_micros(200),
            jitter: Duration::from_micros(100),
            loss_rate: 0.0,
        }
    }

    /// Ideal link with added jitter and loss.
    #[must_use]
    pub fn lossy(loss_rate: f64, jitter: Duration) -> Self {
        Self {
            jitter,
            loss_rate,
            ..Self::ideal()
        }
    }

    fn serialization_delay(&self, len: usize) -> Duration {
        if self.bandwidth_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((len as u64 * 8).saturating_mul(1_000_000_000) / self.bandwidth_bps)
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self::ideal()
    }
}

struct Shared {
    id: ChannelId,
    queue: Mutex<VecDeque<Vec<u8>>>,
    buffered: AtomicUsize,
    closed: AtomicBool,
    wake: Notify,
    inbox: InboxSender,
    sent: AtomicU64,
    bytes: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn pop(&self) -> Option<Vec<u8>> {
        let msg = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()?;
        self.buffered.fetch_sub(msg.len(), Ordering::AcqRel);
        Some(msg)
    }

    fn deliver(&self, msg: Vec<u8>) {
        if self.inbox.send((self.id, msg)).is_ok() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One simulated channel
pub struct SimulatedChannel {
    shared: Arc<Shared>,
}

impl SimulatedChannel {
    /// Pumped channel delivering into `inbox` with the given profile.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn pumped(id: ChannelId, profile: LinkProfile, inbox: InboxSender) -> Arc<Self> {
        let channel = Self::manual(id, inbox);
        tokio::spawn(pump(Arc::clone(&channel.shared), profile));
        channel
    }

    /// Manual channel; messages stay queued until released.
    #[must_use]
    pub fn manual(id: ChannelId, inbox: InboxSender) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                id,
                queue: Mutex::new(VecDeque::new()),
                buffered: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
                inbox,
                sent: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        })
    }

    /// Deliver up to `n` queued messages in FIFO order. Returns how many moved.
    pub fn release(&self, n: usize) -> usize {
        let mut moved = 0;
        while moved < n {
            let Some(msg) = self.shared.pop() else { break };
            self.shared.deliver(msg);
            moved += 1;
        }
        moved
    }

    /// Deliver everything queued.
    pub fn release_all(&self) -> usize {
        self.release(usize::MAX)
    }

    /// Drop up to `n` queued messages without delivering them.
    pub fn discard(&self, n: usize) -> usize {
        let mut dropped = 0;
        while dropped < n && self.shared.pop().is_some() {
            dropped += 1;
        }
        self.shared
            .dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Remove every queued message and hand it to the caller.
    pub fn take_queued(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.shared.pop()).collect()
    }

    /// Messages waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Simulate the substrate failing: close and drop the queue.
    pub fn fail(&self) {
        self.close();
        let lost = self.take_queued().len();
        self.shared
            .dropped
            .fetch_add(lost as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl Channel for SimulatedChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    async fn send(&self, message: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed(self.shared.id));
        }
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.to_vec());
        self.shared
            .buffered
            .fetch_add(message.len(), Ordering::AcqRel);
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        self.shared
            .bytes
            .fetch_add(message.len() as u64, Ordering::Relaxed);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.wake.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.shared.sent.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes.load(Ordering::Relaxed),
            messages_delivered: self.shared.delivered.load(Ordering::Relaxed),
            messages_dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SimulatedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SimulatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChannel")
            .field("id", &self.shared.id)
            .field("buffered", &self.buffered_amount())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn pump(shared: Arc<Shared>, profile: LinkProfile) {
    loop {
        let Some(msg) = shared.pop() else {
            if shared.closed.load(Ordering::Acquire) || shared.inbox.is_closed() {
                break;
            }
            shared.wake.notified().await;
            continue;
        };

        let serialize = profile.serialization_delay(msg.len());
        if !serialize.is_zero() {
            tokio::time::sleep(serialize).await;
        }

        let (lost, extra) = {
            let mut rng = rand::thread_rng();
            let lost = profile.loss_rate > 0.0 && rng.gen_bool(profile.loss_rate.min(1.0));
            let extra = if profile.jitter.is_zero() {
                Duration::ZERO
            } else {
                rng.gen_range(Duration::ZERO..=profile.jitter)
            };
            (lost, extra)
        };
        if lost {
            trace!(channel = shared.id, len = msg.len(), "simulated loss");
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let delay = profile.latency + extra;
        if delay.is_zero() {
            shared.deliver(msg);
        } else {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.deliver(msg);
            });
        }
    }
    trace!(channel = shared.id, "pump stopped");
}

/// One side of a simulated duplex connection
pub struct Endpoint {
    /// Channels this side sends on
    pub channels: Vec<Arc<SimulatedChannel>>,
    /// Messages arriving from the other side
    pub inbox: InboxReceiver,
}

impl Endpoint {
    /// Channels as trait objects, ready for a transport.
    #[must_use]
    pub fn dyn_channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Channel>)
            .collect()
    }
}

/// Pumped duplex connection with `count` channels in each direction.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
#[must_use]
pub fn duplex(count: usize, profile: LinkProfile) -> (Endpoint, Endpoint) {
    build_duplex(count, |id, inbox| SimulatedChannel::pumped(id, profile, inbox))
}

/// Manual duplex connection with `count` channels in each direction.
#[must_use]
pub fn duplex_manual(count: usize) -> (Endpoint, Endpoint) {
    build_duplex(count, SimulatedChannel::manual)
}

fn build_duplex(
    count: usize,
    make: impl Fn(ChannelId, InboxSender) -> Arc<SimulatedChannel>,
) -> (Endpoint, Endpoint) {
    let (to_a, a_inbox) = mpsc::unbounded_channel();
    let (to_b, b_inbox) = mpsc::unbounded_channel();
    let a = Endpoint {
        channels: (0..count).map(|id| make(id, to_b.clone())).collect(),
        inbox: a_inbox,
    };
    let b = Endpoint {
        channels: (0..count).map(|id| make(id, to_a.clone())).collect(),
        inbox: b_inbox,
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_holds_until_released() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ch = SimulatedChannel::manual(1, tx);
        ch.send(b"one").await.unwrap();
        ch.send(b"three").await.unwrap();
        assert_eq!(ch.buffered_amount(), 8);
        assert!(rx.try_recv().is_err());

        assert_eq!(ch.release(1), 1);
        assert_eq!(rx.try_recv().unwrap(), (1, b"one".to_vec()));
        assert_eq!(ch.buffered_amount(), 5);
    }

    #[tokio::test]
    async fn test_fail_closes_and_drops() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ch = SimulatedChannel::manual(0, tx);
        ch.send(b"lost").await.unwrap();
        ch.fail();
        assert!(ch.is_closed());
        assert_eq!(ch.buffered_amount(), 0);
        assert_eq!(ch.stats().messages_dropped, 1);
        assert_eq!(ch.send(b"x").await, Err(TransportError::ChannelClosed(0)));
    }

    #[tokio::test]
    async fn test_pumped_delivers() {
        let (a, mut b) = duplex(2, LinkProfile::ideal());
        a.channels[1].send(b"hello").await.unwrap();
        let (id, msg) = b.inbox.recv().await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(msg, b"hello");
    }

    #[tokio::test]
    async fn test_pumped_total_loss() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ch = SimulatedChannel::pumped(0, LinkProfile::lossy(1.0, Duration::ZERO), tx);
        for _ in 0..10 {
            ch.send(b"gone").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(ch.stats().messages_dropped, 10);
    }

    #[test]
    fn test_serialization_delay() {
        let profile = LinkProfile {
            bandwidth_bps: 8_000,
            ..LinkProfile::ideal()
        };
        assert_eq!(profile.serialization_delay(1000), Duration::from_secs(1));
        assert_eq!(
            LinkProfile::ideal().serialization_delay(1000),
            Duration::ZERO
        );
    }
}
