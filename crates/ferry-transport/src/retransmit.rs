//! Sender-side store of unacknowledged frames.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Unacked {
    encoded: Vec<u8>,
    sent_at: Instant,
    retransmitted: bool,
}

/// Unacknowledged frames keyed by sequence number
#[derive(Debug)]
pub struct RetransmitBuffer {
    frames: BTreeMap<u64, Unacked>,
    capacity: usize,
    bytes: usize,
}

impl RetransmitBuffer {
    /// New buffer holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            capacity: capacity.max(1),
            bytes: 0,
        }
    }

    /// Whether another frame fits.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.frames.len() < self.capacity
    }

    /// Unacknowledged frame count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether every frame has been acknowledged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes held.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Record a frame as sent.
    pub fn insert(&mut self, sequence: u64, encoded: Vec<u8>, now: Instant) {
        self.bytes += encoded.len();
        if let Some(old) = self.frames.insert(
            sequence,
            Unacked {
                encoded,
                sent_at: now,
                retransmitted: false,
            },
        ) {
            self.bytes -= old.encoded.len();
        }
    }

    /// Drop every frame below `next_expected`.
    ///
    /// Returns an RTT sample from the newest acknowledged frame that was
    /// never retransmitted (Karn's rule), if any.
    pub fn acknowledge(&mut self, next_expected: u64, now: Instant) -> Option<Duration> {
        let remaining = self.frames.split_off(&next_expected);
        let acked = std::mem::replace(&mut self.frames, remaining);
        let mut sample = None;
        for (_, frame) in acked.into_iter().rev() {
            self.bytes -= frame.encoded.len();
            if sample.is_none() && !frame.retransmitted {
                sample = Some(now.saturating_duration_since(frame.sent_at));
            }
        }
        sample
    }

    /// Encoded frame for `sequence`, marked as retransmitted.
    ///
    /// Returns `None` if the frame is unknown or was (re)sent less than
    /// `min_age` ago, which suppresses repeated NACKs for the same gap.
    pub fn resend(&mut self, sequence: u64, now: Instant, min_age: Duration) -> Option<Vec<u8>> {
        let frame = self.frames.get_mut(&sequence)?;
        if now.saturating_duration_since(frame.sent_at) < min_age {
            return None;
        }
        frame.retransmitted = true;
        frame.sent_at = now;
        Some(frame.encoded.clone())
    }

    /// Sequence numbers of the oldest `limit` unacknowledged frames.
    #[must_use]
    pub fn oldest(&self, limit: usize) -> Vec<u64> {
        self.frames.keys().take(limit).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_ack() {
        let now = Instant::now();
        let mut buf = RetransmitBuffer::new(8);
        for seq in 0..5 {
            buf.insert(seq, vec![0; 10], now);
        }
        assert_eq!(buf.bytes(), 50);

        buf.acknowledge(3, now);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.bytes(), 20);
        assert_eq!(buf.oldest(10), vec![3, 4]);
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let mut buf = RetransmitBuffer::new(2);
        buf.insert(0, vec![], now);
        assert!(buf.has_room());
        buf.insert(1, vec![], now);
        assert!(!buf.has_room());
    }

    #[test]
    fn test_rtt_sample_skips_retransmitted() {
        let start = Instant::now();
        let mut buf = RetransmitBuffer::new(8);
        buf.insert(0, vec![1], start);
        assert!(buf.resend(0, start, Duration::ZERO).is_some());
        let later = start + Duration::from_millis(40);
        assert_eq!(buf.acknowledge(1, later), None);

        buf.insert(1, vec![1], start);
        assert_eq!(buf.acknowledge(2, later), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_resend_unknown_sequence() {
        let mut buf = RetransmitBuffer::new(8);
        assert!(buf.resend(9, Instant::now(), Duration::ZERO).is_none());
    }

    #[test]
    fn test_resend_suppressed_when_recent() {
        let start = Instant::now();
        let mut buf = RetransmitBuffer::new(8);
        buf.insert(0, vec![1], start);
        let soon = start + Duration::from_millis(5);
        assert!(buf.resend(0, soon, Duration::from_millis(10)).is_none());
        let later = start + Duration::from_millis(20);
        assert!(buf.resend(0, later, Duration::from_millis(10)).is_some());
        assert!(buf.resend(0, later, Duration::from_millis(10)).is_none());
    }
}
