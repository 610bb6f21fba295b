//! Adaptive chunk sizing.
//!
//! The sender keeps a smoothed RTT and a smoothed loss rate. Chunks are
//! largest on low-latency local links and shrink toward the minimum as
//! RTT or loss grows.

use crate::config::ChunkSizingConfig;
use std::time::Duration;

/// RTT and loss driven chunk size recommendation
#[derive(Debug, Clone)]
pub struct AdaptiveChunkSizer {
    config: ChunkSizingConfig,
    srtt_us: Option<f64>,
    loss: f64,
}

impl AdaptiveChunkSizer {
    /// New sizer with no samples.
    #[must_use]
    pub fn new(config: ChunkSizingConfig) -> Self {
        Self {
            config,
            srtt_us: None,
            loss: 0.0,
        }
    }

    /// Fold in one RTT sample.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_micros() as f64;
        let alpha = self.config.rtt_alpha;
        self.srtt_us = Some(match self.srtt_us {
            Some(srtt) => (1.0 - alpha) * srtt + alpha * sample,
            None => sample,
        });
    }

    /// Fold in one delivery outcome.
    pub fn record_delivery(&mut self, lost: bool) {
        let sample = if lost { 1.0 } else { 0.0 };
        let alpha = self.config.loss_alpha;
        self.loss = (1.0 - alpha) * self.loss + alpha * sample;
    }

    /// Smoothed RTT, if any sample has been seen.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt_us.map(|us| Duration::from_micros(us as u64))
    }

    /// Smoothed loss rate in `[0, 1]`.
    #[must_use]
    pub fn loss_rate(&self) -> f64 {
        self.loss
    }

    /// Recommended chunk size in bytes.
    #[must_use]
    pub fn recommended(&self) -> usize {
        let min = self.config.min_chunk as f64;
        let max = self.config.max_chunk as f64;

        let base = match self.srtt_us {
            None => self.config.initial_chunk as f64,
            Some(srtt) => {
                let local_us = (self.config.local_rtt_ms * 1000).max(1) as f64;
                max * (local_us / srtt.max(1.0)).min(1.0)
            }
        };
        let penalty = 1.0 - (self.loss * 10.0).min(0.9);
        (base * penalty).clamp(min, max) as usize
    }
}

impl Default for AdaptiveChunkSizer {
    fn default() -> Self {
        Self::new(ChunkSizingConfig::default())
    }
}
