//! Progress tracking and change-driven aggregation.
//!
//! Per-recipient progress is published on a `watch` channel. The group view
//! is the arithmetic mean of every recipient's byte fraction and is only
//! reported when it moved by at least one percentage point, or when it
//! changed at all and the minimum interval has passed since the last report.

use crate::recipient::RecipientId;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Smallest change in percentage points worth reporting immediately
pub const REPORT_STEP_PERCENT: f64 = 1.0;

/// State of one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientStatus {
    /// Not started
    Pending,
    /// Invite or handshake in flight
    Negotiating,
    /// Handshake complete, no data sent yet
    Ready,
    /// Sending data
    Transferring,
    /// Receiver verified the file
    Completed,
    /// Terminated by an error
    Failed,
    /// Terminated by cancellation
    Cancelled,
}

impl RecipientStatus {
    /// Whether no further transitions happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Overall state of a group transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    /// Validating input and hashing the file
    Preparing,
    /// Inviting recipients and running handshakes
    Negotiating,
    /// At least one recipient is receiving data
    Transferring,
    /// Every recipient succeeded
    Completed,
    /// Some, not all, recipients succeeded
    Partial,
    /// No recipient succeeded
    Failed,
}

impl GroupStatus {
    /// Final status for `succeeded` out of `total` recipients.
    #[must_use]
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        match succeeded {
            0 => Self::Failed,
            n if n == total => Self::Completed,
            _ => Self::Partial,
        }
    }

    /// Whether the group has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "preparing",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientProgress {
    /// Recipient
    pub recipient: RecipientId,
    /// Current state
    pub status: RecipientStatus,
    /// File bytes handed to the transport
    pub bytes_sent: u64,
    /// File size
    pub bytes_total: u64,
}

impl RecipientProgress {
    /// Initial progress for a recipient.
    #[must_use]
    pub fn new(recipient: RecipientId, bytes_total: u64) -> Self {
        Self {
            recipient,
            status: RecipientStatus::Pending,
            bytes_sent: 0,
            bytes_total,
        }
    }

    /// Fraction of the file sent, `0.0..=1.0`.
    ///
    /// A completed recipient counts as 1.0 and a failed one keeps whatever
    /// it reached.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.status == RecipientStatus::Completed {
            return 1.0;
        }
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 / self.bytes_total as f64).min(1.0)
    }
}

/// Async sequence of progress snapshots for one recipient.
///
/// Ends after yielding a terminal status.
#[derive(Debug)]
pub struct ProgressStream {
    rx: watch::Receiver<RecipientProgress>,
    done: bool,
}

impl ProgressStream {
    pub(crate) fn new(rx: watch::Receiver<RecipientProgress>) -> Self {
        Self { rx, done: false }
    }

    /// Latest snapshot without waiting.
    #[must_use]
    pub fn current(&self) -> RecipientProgress {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<RecipientProgress> {
        if self.done {
            return None;
        }
        if self.rx.changed().await.is_err() {
            self.done = true;
            return None;
        }
        let progress = self.rx.borrow_and_update().clone();
        if progress.status.is_terminal() {
            self.done = true;
        }
        Some(progress)
    }

    /// Drain the stream and return the terminal snapshot.
    pub async fn finish(mut self) -> RecipientProgress {
        let mut last = self.current();
        while !last.status.is_terminal() {
            match self.next().await {
                Some(progress) => last = progress,
                None => break,
            }
        }
        last
    }
}

/// Group progress report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateProgress {
    /// Mean completion across recipients, `0.0..=100.0`
    pub percent: f64,
    /// Recipients still running
    pub active: usize,
    /// Recipients finished successfully
    pub completed: usize,
    /// Recipients failed or cancelled
    pub failed: usize,
}

/// Change-driven group progress aggregator
#[derive(Debug)]
pub struct ProgressAggregator {
    fractions: Vec<f64>,
    statuses: Vec<RecipientStatus>,
    last_reported: Option<(f64, Instant)>,
    min_interval: Duration,
}

impl ProgressAggregator {
    /// Aggregator for `recipients` slots.
    #[must_use]
    pub fn new(recipients: usize, min_interval: Duration) -> Self {
        Self {
            fractions: vec![0.0; recipients],
            statuses: vec![RecipientStatus::Pending; recipients],
            last_reported: None,
            min_interval,
        }
    }

    /// Current aggregate, whether or not it would be reported.
    #[must_use]
    pub fn snapshot(&self) -> AggregateProgress {
        let n = self.fractions.len().max(1) as f64;
        let percent = self.fractions.iter().sum::<f64>() / n * 100.0;
        let completed = self
            .statuses
            .iter()
            .filter(|s| **s == RecipientStatus::Completed)
            .count();
        let failed = self
            .statuses
            .iter()
            .filter(|s| matches!(s, RecipientStatus::Failed | RecipientStatus::Cancelled))
            .count();
        AggregateProgress {
            percent,
            active: self.statuses.len() - completed - failed,
            completed,
            failed,
        }
    }

    /// Record a recipient update; returns the aggregate if it should be reported.
    pub fn update(
        &mut self,
        index: usize,
        progress: &RecipientProgress,
    ) -> Option<AggregateProgress> {
        self.update_at(index, progress, Instant::now())
    }

    /// [`Self::update`] against an explicit clock.
    pub fn update_at(
        &mut self,
        index: usize,
        progress: &RecipientProgress,
        now: Instant,
    ) -> Option<AggregateProgress> {
        let slot = self.fractions.get_mut(index)?;
        *slot = progress.fraction();
        let status_changed = self.statuses[index] != progress.status;
        self.statuses[index] = progress.status;

        let snapshot = self.snapshot();
        let report = match self.last_reported {
            None => true,
            Some((last, at)) => {
                let delta = (snapshot.percent - last).abs();
                delta >= REPORT_STEP_PERCENT
                    || (delta > 0.0 && now.saturating_duration_since(at) >= self.min_interval)
                    || (status_changed && progress.status.is_terminal())
            }
        };
        if report {
            self.last_reported = Some((snapshot.percent, now));
            Some(snapshot)
        } else {
            None
        }
    }
}
