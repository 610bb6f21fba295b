//! In-order reassembly of sequenced frames.
//!
//! Frames may arrive in any order across channels. The reassembler holds
//! out-of-order payloads in a bounded window and releases them strictly
//! in sequence order.

use std::collections::BTreeMap;

/// Outcome of offering one frame to the reassembler
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reassembled {
    /// Payloads now deliverable, in sequence order
    pub ready: Vec<Vec<u8>>,
    /// First missing sequence number, when a retransmission should be requested
    pub missing: Option<u64>,
    /// The frame was a duplicate of one already delivered or buffered
    pub duplicate: bool,
}

/// Bounded in-order reassembler
#[derive(Debug)]
pub struct Reassembler {
    next_expected: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    window: usize,
}

impl Reassembler {
    /// New reassembler expecting sequence 0.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            window: window.max(1),
        }
    }

    /// Next sequence number that would be delivered.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Out-of-order payloads currently held.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Offer one data frame.
    ///
    /// Frames beyond the window are dropped and trigger a retransmission
    /// request for the gap; the sender will resend them.
    pub fn accept(&mut self, sequence: u64, payload: Vec<u8>) -> Reassembled {
        let mut out = Reassembled::default();

        if sequence < self.next_expected || self.pending.contains_key(&sequence) {
            out.duplicate = true;
            return out;
        }

        if sequence - self.next_expected >= self.window as u64 {
            out.missing = Some(self.next_expected);
            return out;
        }

        self.pending.insert(sequence, payload);
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            out.ready.push(payload);
            self.next_expected += 1;
        }

        // A gap holding back half the window is worth a NACK rather than
        // waiting for the sender's ack timeout.
        if !self.pending.is_empty() && self.pending.len() * 2 >= self.window {
            out.missing = Some(self.next_expected);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_passthrough() {
        let mut r = Reassembler::new(8);
        for i in 0..5u64 {
            let out = r.accept(i, vec![i as u8]);
            assert_eq!(out.ready, vec![vec![i as u8]]);
        }
        assert_eq!(r.next_expected(), 5);
    }

    #[test]
    fn test_scrambled_order() {
        let mut r = Reassembler::new(8);
        let mut delivered = Vec::new();
        for i in [2u64, 0, 4, 1, 3] {
            delivered.extend(r.accept(i, vec![i as u8]).ready);
        }
        assert_eq!(delivered, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn test_duplicates_flagged() {
        let mut r = Reassembler::new(8);
        r.accept(0, vec![0]);
        r.accept(2, vec![2]);
        assert!(r.accept(0, vec![0]).duplicate);
        assert!(r.accept(2, vec![2]).duplicate);
        assert!(!r.accept(1, vec![1]).duplicate);
    }

    #[test]
    fn test_beyond_window_requests_gap() {
        let mut r = Reassembler::new(4);
        let out = r.accept(10, vec![]);
        assert!(out.ready.is_empty());
        assert_eq!(out.missing, Some(0));
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn test_half_full_window_nacks() {
        let mut r = Reassembler::new(4);
        assert_eq!(r.accept(1, vec![]).missing, None);
        assert_eq!(r.accept(2, vec![]).missing, Some(0));
    }
}
