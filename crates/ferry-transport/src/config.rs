//! Transport configuration.

use crate::backpressure::Watermarks;
use crate::error::TransportError;
use crate::{MAX_CHANNELS, MIN_CHANNELS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parallel transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Channels per peer connection (2-4)
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,

    /// Buffered bytes above which a channel is paused
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// Buffered bytes below which a paused channel resumes
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,

    /// Send attempts (or ack timeouts) before an error is surfaced
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,

    /// Delay between send retries, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Poll interval while waiting for a channel to drain, in milliseconds
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,

    /// Longest wait for any channel to drain, in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Wait for acknowledgement progress before retransmitting, in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Out-of-order frames the receiver buffers before requesting retransmission
    #[serde(default = "default_reassembly_window")]
    pub reassembly_window: usize,

    /// Unacknowledged frames the sender keeps for retransmission
    #[serde(default = "default_retransmit_capacity")]
    pub retransmit_capacity: usize,

    /// Adaptive chunk sizing
    #[serde(default)]
    pub sizing: ChunkSizingConfig,
}

fn default_channel_count() -> usize {
    3
}

fn default_high_watermark() -> usize {
    1024 * 1024
}

fn default_low_watermark() -> usize {
    256 * 1024
}

fn default_max_send_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_drain_poll_interval_ms() -> u64 {
    5
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    2_000
}

fn default_reassembly_window() -> usize {
    256
}

fn default_retransmit_capacity() -> usize {
    1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_count: default_channel_count(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            max_send_retries: default_max_send_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            reassembly_window: default_reassembly_window(),
            retransmit_capacity: default_retransmit_capacity(),
            sizing: ChunkSizingConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Watermarks for each channel's backpressure gate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] unless `low < high`.
    pub fn watermarks(&self) -> Result<Watermarks, TransportError> {
        Watermarks::new(self.high_watermark, self.low_watermark)
    }

    /// Retry backoff.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Drain poll interval.
    #[must_use]
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }

    /// Drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Ack timeout.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channel_count) {
            return Err(TransportError::InvalidConfig(format!(
                "channel_count must be {MIN_CHANNELS}-{MAX_CHANNELS}, got {}",
                self.channel_count
            )));
        }
        self.watermarks()?;
        if self.reassembly_window == 0 || self.retransmit_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "reassembly_window and retransmit_capacity must be > 0".into(),
            ));
        }
        self.sizing.validate()
    }
}

/// Bounds and smoothing for adaptive chunk sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSizingConfig {
    /// Smallest chunk, used on lossy high-latency paths
    #[serde(default = "default_min_chunk")]
    pub min_chunk: usize,

    /// Chunk size before any RTT sample
    #[serde(default = "default_initial_chunk")]
    pub initial_chunk: usize,

    /// Largest chunk, used on low-latency local links
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,

    /// EMA weight for new RTT samples
    #[serde(default = "default_rtt_alpha")]
    pub rtt_alpha: f64,

    /// EMA weight for new loss samples
    #[serde(default = "default_loss_alpha")]
    pub loss_alpha: f64,

    /// RTT at or below which `max_chunk` is used, in milliseconds
    #[serde(default = "default_local_rtt_ms")]
    pub local_rtt_ms: u64,
}

fn default_min_chunk() -> usize {
    16 * 1024
}

fn default_initial_chunk() -> usize {
    256 * 1024
}

fn default_max_chunk() -> usize {
    4 * 1024 * 1024
}

fn default_rtt_alpha() -> f64 {
    0.125
}

fn default_loss_alpha() -> f64 {
    0.1
}

fn default_local_rtt_ms() -> u64 {
    5
}

impl Default for ChunkSizingConfig {
    fn default() -> Self {
        Self {
            min_chunk: default_min_chunk(),
            initial_chunk: default_initial_chunk(),
            max_chunk: default_max_chunk(),
            rtt_alpha: default_rtt_alpha(),
            loss_alpha: default_loss_alpha(),
            local_rtt_ms: default_local_rtt_ms(),
        }
    }
}

impl ChunkSizingConfig {
    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] unless
    /// `0 < min <= initial <= max` and both alphas lie in `(0, 1]`.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.min_chunk == 0
            || self.min_chunk > self.initial_chunk
            || self.initial_chunk > self.max_chunk
        {
            return Err(TransportError::InvalidConfig(format!(
                "chunk sizes must satisfy 0 < min ({}) <= initial ({}) <= max ({})",
                self.min_chunk, self.initial_chunk, self.max_chunk
            )));
        }
        let alpha_ok = |a: f64| a > 0.0 && a <= 1.0;
        if !alpha_ok(self.rtt_alpha) || !alpha_ok(self.loss_alpha) {
            return Err(TransportError::InvalidConfig(
                "smoothing factors must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}
