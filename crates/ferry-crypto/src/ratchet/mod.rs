//! Ratchet protocol.
//!
//! - [`chain`]: symmetric chain and root KDFs
//! - [`double`]: Double Ratchet (forward secrecy, break-in recovery)
//! - [`sparse_pq`]: epoch-based post-quantum re-keying
//! - [`triple`]: the composite session combining both

pub mod chain;
pub mod double;
pub mod sparse_pq;
pub mod triple;

pub use triple::{
    MessageHeader, RatchetMessage, Role, SessionParameters, SessionState, TripleRatchetSession,
};

use crate::CryptoError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one ratchet session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Maximum out-of-order gap, and capacity of the skipped-key cache
    #[serde(default = "default_max_skip")]
    pub max_skip: u32,

    /// Messages per epoch before the sender re-keys
    #[serde(default = "default_epoch_message_threshold")]
    pub epoch_message_threshold: u32,

    /// Seconds per epoch before the sender re-keys
    #[serde(default = "default_epoch_interval_secs")]
    pub epoch_interval_secs: u64,

    /// Future epochs whose ciphertexts may be buffered
    #[serde(default = "default_max_pending_epochs")]
    pub max_pending_epochs: usize,

    /// Superseded epoch keys always kept, on top of those a cached skipped
    /// message key may still need
    #[serde(default = "default_retained_epoch_keys")]
    pub retained_epoch_keys: usize,
}

fn default_max_skip() -> u32 {
    double::DEFAULT_MAX_SKIP
}

fn default_epoch_message_threshold() -> u32 {
    10
}

fn default_epoch_interval_secs() -> u64 {
    300
}

fn default_max_pending_epochs() -> usize {
    8
}

fn default_retained_epoch_keys() -> usize {
    2
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: default_max_skip(),
            epoch_message_threshold: default_epoch_message_threshold(),
            epoch_interval_secs: default_epoch_interval_secs(),
            max_pending_epochs: default_max_pending_epochs(),
            retained_epoch_keys: default_retained_epoch_keys(),
        }
    }
}

impl RatchetConfig {
    /// Epoch time threshold.
    #[must_use]
    pub fn epoch_interval(&self) -> Duration {
        Duration::from_secs(self.epoch_interval_secs)
    }

    /// Reject configurations that would disable a bound.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParameter`] naming the offending field.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.max_skip == 0 {
            return Err(CryptoError::InvalidParameter("max_skip must be > 0".into()));
        }
        if self.epoch_message_threshold == 0 {
            return Err(CryptoError::InvalidParameter(
                "epoch_message_threshold must be > 0".into(),
            ));
        }
        if self.epoch_interval_secs == 0 {
            return Err(CryptoError::InvalidParameter(
                "epoch_interval_secs must be > 0".into(),
            ));
        }
        if self.max_pending_epochs == 0 || self.retained_epoch_keys == 0 {
            return Err(CryptoError::InvalidParameter(
                "epoch buffers must hold at least one entry".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatchetConfig::default();
        assert_eq!(config.max_skip, 1000);
        assert_eq!(config.epoch_message_threshold, 10);
        assert_eq!(config.epoch_interval(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let config = RatchetConfig {
            max_skip: 0,
            ..RatchetConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
