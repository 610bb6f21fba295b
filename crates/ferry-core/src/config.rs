//! Engine configuration.

use crate::error::{FerryError, Result};
use ferry_crypto::RatchetConfig;
use ferry_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest plaintext carried in one chunk, whatever the sizer recommends
pub const MAX_CHUNK_PLAINTEXT: usize = 4 * 1024 * 1024;

/// Allowed clock skew for signaling timestamps from the future
pub const SIGNALING_FUTURE_SKEW: Duration = Duration::from_secs(5);

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Transfer orchestration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Ratchet protocol
    #[serde(default)]
    pub ratchet: RatchetConfig,

    /// Parallel channel transport
    #[serde(default)]
    pub transport: TransportConfig,
}

impl FerryConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] naming the failing section.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        self.ratchet
            .validate()
            .map_err(|e| FerryError::validation(format!("ratchet: {e}")))?;
        self.transport
            .validate()
            .map_err(|e| FerryError::validation(format!("transport: {e}")))?;
        Ok(())
    }
}

/// Transfer orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Total outbound rate across all recipients in bytes/s, 0 for unlimited
    #[serde(default)]
    pub bandwidth_limit_bps: u64,

    /// Longest silence between progress reports while progress changes, in milliseconds
    #[serde(default = "default_progress_min_interval_ms")]
    pub progress_min_interval_ms: u64,

    /// Maximum age of a signaling message, in seconds
    #[serde(default = "default_signaling_freshness_secs")]
    pub signaling_freshness_secs: u64,

    /// Maximum live sessions in the registry
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    /// Handshake round-trip timeout, in seconds
    #[serde(default = "default_key_exchange_timeout_secs")]
    pub key_exchange_timeout_secs: u64,

    /// Wait for the receiver's verification receipt, in seconds
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,

    /// Largest file a receiver accepts, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_progress_min_interval_ms() -> u64 {
    500
}

fn default_signaling_freshness_secs() -> u64 {
    60
}

fn default_registry_capacity() -> usize {
    64
}

fn default_key_exchange_timeout_secs() -> u64 {
    10
}

fn default_receipt_timeout_secs() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    64 * 1024 * 1024 * 1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bandwidth_limit_bps: 0,
            progress_min_interval_ms: default_progress_min_interval_ms(),
            signaling_freshness_secs: default_signaling_freshness_secs(),
            registry_capacity: default_registry_capacity(),
            key_exchange_timeout_secs: default_key_exchange_timeout_secs(),
            receipt_timeout_secs: default_receipt_timeout_secs(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl TransferConfig {
    /// Progress report interval.
    #[must_use]
    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    /// Signaling freshness window.
    #[must_use]
    pub fn signaling_freshness(&self) -> Duration {
        Duration::from_secs(self.signaling_freshness_secs)
    }

    /// Handshake timeout.
    #[must_use]
    pub fn key_exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.key_exchange_timeout_secs)
    }

    /// Receipt timeout.
    #[must_use]
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] for zero capacities or timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.registry_capacity == 0 {
            return Err(FerryError::validation("registry_capacity must be > 0"));
        }
        if self.key_exchange_timeout_secs == 0 || self.receipt_timeout_secs == 0 {
            return Err(FerryError::validation("timeouts must be > 0"));
        }
        if self.signaling_freshness_secs == 0 {
            return Err(FerryError::validation(
                "signaling_freshness_secs must be > 0",
            ));
        }
        if self.max_file_size == 0 {
            return Err(FerryError::validation("max_file_size must be > 0"));
        }
        Ok(())
    }
}
