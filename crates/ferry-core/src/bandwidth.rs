//! Fair-share bandwidth allocation.
//!
//! The orchestrator owns one [`BandwidthBudget`]. Each active recipient
//! holds a `watch` receiver with its current share; shares are re-divided
//! whenever a recipient joins or terminates. Sessions never mutate the
//! budget themselves.

use crate::recipient::RecipientId;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Share value meaning "no limit"
pub const UNLIMITED: u64 = 0;

/// Total outbound budget divided evenly across active recipients
#[derive(Debug)]
pub struct BandwidthBudget {
    total_bps: u64,
    shares: Mutex<HashMap<RecipientId, watch::Sender<u64>>>,
}

impl BandwidthBudget {
    /// Budget of `total_bps` bytes per second; [`UNLIMITED`] disables pacing.
    #[must_use]
    pub fn new(total_bps: u64) -> Self {
        Self {
            total_bps,
            shares: Mutex::new(HashMap::new()),
        }
    }

    /// Add an active recipient and return its share receiver.
    pub fn register(&self, recipient: &RecipientId) -> watch::Receiver<u64> {
        let mut shares = self.shares.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = watch::channel(UNLIMITED);
        shares.insert(recipient.clone(), tx);
        self.redistribute(&shares);
        rx
    }

    /// Remove a recipient that terminated; the others get its share.
    pub fn release(&self, recipient: &RecipientId) {
        let mut shares = self.shares.lock().unwrap_or_else(PoisonError::into_inner);
        if shares.remove(recipient).is_some() {
            self.redistribute(&shares);
        }
    }

    /// Current per-recipient share.
    #[must_use]
    pub fn share(&self) -> u64 {
        let shares = self.shares.lock().unwrap_or_else(PoisonError::into_inner);
        self.share_for(shares.len())
    }

    /// Recipients currently sharing the budget.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn share_for(&self, active: usize) -> u64 {
        if self.total_bps == UNLIMITED || active == 0 {
            return UNLIMITED;
        }
        (self.total_bps / active as u64).max(1)
    }

    fn redistribute(&self, shares: &HashMap<RecipientId, watch::Sender<u64>>) {
        let share = self.share_for(shares.len());
        for tx in shares.values() {
            tx.send_replace(share);
        }
        debug!(active = shares.len(), share_bps = share, "bandwidth re-divided");
    }
}

/// Paces one session's sends to its current share.
#[derive(Debug)]
pub struct Pacer {
    share: watch::Receiver<u64>,
    next_send: Option<Instant>,
}

impl Pacer {
    /// Pacer following `share`.
    #[must_use]
    pub fn new(share: watch::Receiver<u64>) -> Self {
        Self {
            share,
            next_send: None,
        }
    }

    /// Pacer that never waits.
    #[must_use]
    pub fn unlimited() -> Self {
        let (_tx, rx) = watch::channel(UNLIMITED);
        Self::new(rx)
    }

    /// Current rate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        *self.share.borrow()
    }

    /// Wait until `bytes` may be sent at the current rate.
    pub async fn acquire(&mut self, bytes: usize) {
        let rate = self.rate();
        if rate == UNLIMITED {
            self.next_send = None;
            return;
        }
        let now = Instant::now();
        let start = match self.next_send {
            Some(at) if at > now => {
                tokio::time::sleep_until(at).await;
                at
            }
            _ => now,
        };
        let cost = Duration::from_secs_f64(bytes as f64 / rate as f64);
        self.next_send = Some(start + cost);
    }
}
