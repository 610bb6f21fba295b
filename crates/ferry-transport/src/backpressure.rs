//! Per-channel backpressure with hysteresis.
//!
//! A channel is paused once its buffered amount rises above the high
//! watermark and stays paused until it falls below the low watermark.
//! Between the two thresholds the previous state is kept, so a channel
//! hovering near one threshold cannot flap.

use crate::error::TransportError;

/// High/low watermark pair, `low < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    high: usize,
    low: usize,
}

impl Watermarks {
    /// Create a watermark pair.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] unless `low < high`.
    pub fn new(high: usize, low: usize) -> Result<Self, TransportError> {
        if low >= high {
            return Err(TransportError::InvalidConfig(format!(
                "low watermark ({low}) must be below high watermark ({high})"
            )));
        }
        Ok(Self { high, low })
    }

    /// Pause threshold.
    #[must_use]
    pub fn high(&self) -> usize {
        self.high
    }

    /// Resume threshold.
    #[must_use]
    pub fn low(&self) -> usize {
        self.low
    }
}

/// Whether a channel may be offered more data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Accepting data
    Open,
    /// Waiting to drain below the low watermark
    Paused,
}

/// Hysteresis state machine for one channel.
#[derive(Debug, Clone)]
pub struct BackpressureGate {
    watermarks: Watermarks,
    state: FlowState,
    pauses: u64,
}

impl BackpressureGate {
    /// New gate in the open state.
    #[must_use]
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            watermarks,
            state: FlowState::Open,
            pauses: 0,
        }
    }

    /// Feed the channel's current buffered amount and get the resulting state.
    pub fn observe(&mut self, buffered: usize) -> FlowState {
        self.state = match self.state {
            FlowState::Open if buffered > self.watermarks.high => {
                self.pauses += 1;
                FlowState::Paused
            }
            FlowState::Paused if buffered < self.watermarks.low => FlowState::Open,
            unchanged => unchanged,
        };
        self.state
    }

    /// State as of the last observation.
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Number of open-to-paused transitions so far.
    #[must_use]
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> BackpressureGate {
        BackpressureGate::new(Watermarks::new(1000, 200).unwrap())
    }

    #[test]
    fn test_pauses_above_high() {
        let mut g = gate();
        assert_eq!(g.observe(1000), FlowState::Open);
        assert_eq!(g.observe(1001), FlowState::Paused);
        assert_eq!(g.pauses(), 1);
    }

    #[test]
    fn test_stays_paused_between_thresholds() {
        let mut g = gate();
        g.observe(5000);
        for level in [999, 500, 200, 999, 201] {
            assert_eq!(g.observe(level), FlowState::Paused, "level {level}");
        }
        assert_eq!(g.observe(199), FlowState::Open);
    }

    #[test]
    fn test_stays_open_between_thresholds() {
        let mut g = gate();
        for level in [0, 500, 999, 1000, 300] {
            assert_eq!(g.observe(level), FlowState::Open);
        }
        assert_eq!(g.pauses(), 0);
    }

    #[test]
    fn test_one_pause_per_cycle() {
        let mut g = gate();
        for _ in 0..3 {
            g.observe(2000);
            g.observe(1500);
            g.observe(100);
        }
        assert_eq!(g.pauses(), 3);
    }

    #[test]
    fn test_watermarks_must_be_ordered() {
        assert!(Watermarks::new(100, 100).is_err());
        assert!(Watermarks::new(100, 200).is_err());
        assert!(Watermarks::new(200, 100).is_ok());
    }
}
