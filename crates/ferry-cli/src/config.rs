//! Configuration file for the Ferry CLI.

use ferry_core::FerryConfig;
use ferry_transport::simulated::LinkProfile;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine settings (transfer, ratchet, transport sections)
    #[serde(flatten)]
    pub engine: FerryConfig,
    /// Identity settings
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Simulated network used by the local commands
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// File holding the hex-encoded identity seed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Name shown to recipients
    #[serde(default = "default_sender_name")]
    pub display_name: String,
}

/// Simulated link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Link preset: `ideal`, `lan` or `lossy`
    #[serde(default = "default_link")]
    pub link: String,
    /// Loss probability for the `lossy` preset
    #[serde(default = "default_loss_rate")]
    pub loss_rate: f64,
    /// Jitter for the `lossy` preset, in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_sender_name() -> String {
    "ferry".to_string()
}

fn default_link() -> String {
    "lan".to_string()
}

fn default_loss_rate() -> f64 {
    0.02
}

fn default_jitter_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            display_name: default_sender_name(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            link: default_link(),
            loss_rate: default_loss_rate(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SimulationConfig {
    /// Link profile for the configured preset.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset.
    pub fn profile(&self) -> anyhow::Result<LinkProfile> {
        match self.link.as_str() {
            "ideal" => Ok(LinkProfile::ideal()),
            "lan" => Ok(LinkProfile::lan()),
            "lossy" => Ok(LinkProfile::lossy(
                self.loss_rate,
                Duration::from_millis(self.jitter_ms),
            )),
            other => {
                anyhow::bail!("Unknown link preset: {other}. Must be one of: ideal, lan, lossy")
            }
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ferry/config.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        self.simulation.profile()?;
        if !(0.0..1.0).contains(&self.simulation.loss_rate) {
            anyhow::bail!("loss_rate must be in [0, 1)");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }
}
