//! Configuration for the register engine
//!
//! [`EngineConfig`] collects the tunables of a [`Root`](crate::root::Root):
//! transaction timeouts, the poll thread, the update dispatch queue and startup
//! behaviour. Every field has a default so partial files are accepted.
//!
//! # File formats
//!
//! Files ending in `.json` are read and written as JSON, everything else as TOML.
//!
//! # Example
//!
//! ```ignore
//! use regtree_rs::config::EngineConfig;
//!
//! let config = EngineConfig::load_or_default("engine.toml");
//! println!("timeout: {:?}", config.transaction.timeout());
//! ```
//!
//! ```toml
//! [transaction]
//! timeout_ms = 500
//! retry_count = 1
//!
//! [poll]
//! enabled = true
//! ```

use crate::error::{RegError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "regtree-rs";

/// Default engine config filename
pub const CONFIG_FILE: &str = "engine.toml";

/// Default Block transaction timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default capacity of the update dispatch queue
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Default location of the engine config file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub startup: StartupConfig,
}

/// Foreground transaction behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Time a transaction may stay pending before it is failed with a timeout
    pub timeout_ms: u64,
    /// Re-issues of a timed out foreground transaction
    pub retry_count: u32,
}

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: 0,
        }
    }
}

/// Poll thread settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Start the poll thread with the tree
    pub enabled: bool,
    pub thread_name: String,
    /// Trickle flush period for the drain batch (0 flushes only when the drain ends)
    pub flush_period_ms: u64,
}

impl PollConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_name: "poll".to_string(),
            flush_period_ms: 0,
        }
    }
}

/// Update dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Flushed batches that may wait for the consumer before producers block
    pub channel_capacity: usize,
    pub thread_name: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            thread_name: "update".to_string(),
        }
    }
}

/// Tree activation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Read the whole tree once after activation
    pub initial_read: bool,
    /// Reject overlapping Blocks on one endpoint
    pub check_overlaps: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            initial_read: true,
            check_overlaps: true,
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

impl EngineConfig {
    /// Load a config file (JSON or TOML by extension)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if is_json(path) {
            serde_json::from_str(&content)
                .map_err(|e| RegError::Config(format!("Failed to parse {}: {}", path.display(), e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| RegError::Config(format!("Failed to parse {}: {}", path.display(), e)))
        }
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a file (JSON or TOML by extension), creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| RegError::Serialization(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content)
            .map_err(|e| RegError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.transaction.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.transaction.retry_count = retries;
        self
    }

    pub fn with_polling(mut self, enabled: bool) -> Self {
        self.poll.enabled = enabled;
        self
    }

    pub fn with_initial_read(mut self, enabled: bool) -> Self {
        self.startup.initial_read = enabled;
        self
    }
}

/// Debug probe connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe selector ("VID:PID" or part of the serial number)
    pub probe_selector: Option<String>,
    /// Target name known to the probe-rs registry
    pub target_chip: String,
    /// Communication speed in kHz
    pub speed_khz: u32,
    pub protocol: ProbeProtocol,
    /// Core whose memory interface carries the register traffic
    pub core_index: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_selector: None,
            target_chip: "STM32F407VGTx".to_string(),
            speed_khz: 4000,
            protocol: ProbeProtocol::Swd,
            core_index: 0,
        }
    }
}

/// Probe protocol options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProbeProtocol {
    /// Serial Wire Debug
    #[default]
    Swd,
    /// JTAG
    Jtag,
}

impl std::fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeProtocol::Swd => write!(f, "SWD"),
            ProbeProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transaction.timeout(), Duration::from_secs(1));
        assert_eq!(config.transaction.retry_count, 0);
        assert!(config.poll.enabled);
        assert_eq!(config.update.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(config.startup.check_overlaps);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("[transaction]\ntimeout_ms = 250\n").unwrap();
        assert_eq!(config.transaction.timeout_ms, 250);
        assert_eq!(config.transaction.retry_count, 0);
        assert_eq!(config.poll.thread_name, "poll");
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::default()
            .with_timeout(Duration::from_millis(20))
            .with_retries(2)
            .with_polling(false);
        assert_eq!(config.transaction.timeout_ms, 20);
        assert_eq!(config.transaction.retry_count, 2);
        assert!(!config.poll.enabled);
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("regtree-rs/engine.toml"));
        }
    }

    #[test]
    fn test_probe_protocol_display() {
        assert_eq!(ProbeProtocol::Swd.to_string(), "SWD");
        assert_eq!(ProbeProtocol::Jtag.to_string(), "JTAG");
    }
}
