/*!
Configuration management for the device bridge.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::{StoreConfig, UnknownFramePolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Extra device profile files, loaded on top of the built-in profiles
    #[serde(default)]
    pub profiles: Vec<PathBuf>,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Devices expected on the link, connected at startup
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            bridge: BridgeConfig::default(),
            store: StoreConfig::default(),
            devices: vec![DeviceConfig::new("arm-1", "deep_arm")],
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            warn!("⚠️ Config file {} not found, using defaults", path.as_ref().display());
            Ok(Self::new())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Link and runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial-over-TCP bridge host
    pub host: String,

    /// Serial-over-TCP bridge port
    pub port: u16,

    /// Socket receive buffer size
    pub recv_buffer_bytes: usize,

    /// How long one transport read waits for a line
    pub read_timeout_ms: u64,

    /// Watchdog interval of the store actor
    pub tick_interval_ms: u64,

    /// Bounded wait for a command queue slot and for its reply
    pub request_timeout_ms: u64,

    /// Channel capacity between the reader loop and the store actor
    pub frame_queue_size: usize,

    /// Channel capacity for command requests
    pub command_queue_size: usize,

    /// Channel capacity for outgoing telegrams
    pub outbound_queue_size: usize,

    /// Channel capacity for published events
    pub event_queue_size: usize,

    /// Frames no connected device knows
    pub unknown_frames: UnknownFramePolicy,

    /// Statistics reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            recv_buffer_bytes: 64 * 1024,
            read_timeout_ms: 20,
            tick_interval_ms: 100,
            request_timeout_ms: 1000,
            frame_queue_size: 1024,
            command_queue_size: 64,
            outbound_queue_size: 64,
            event_queue_size: 1024,
            unknown_frames: UnknownFramePolicy::Drop,
            stats_interval_seconds: 10,
        }
    }
}

impl BridgeConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One device on the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub device_type: String,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
        }
    }
}
