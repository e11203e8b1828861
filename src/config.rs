//! Settings file handling for ovpnctl

use crate::device::MonitorOptions;
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("No configuration directory on this system")]
    NoConfigDir,
    #[error("Setting '{0}' needs a host event source the command line does not have")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub device: DeviceSettings,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub binary: PathBuf,
    pub runtime_dir: PathBuf,
    /// Seconds between traffic reports
    pub bytecount_interval: u64,
    pub verbosity: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let runtime = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            binary: PathBuf::from("openvpn"),
            runtime_dir: runtime.join("ovpnctl"),
            bytecount_interval: 2,
            verbosity: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub pause_on_screen_off: bool,
    pub reconnect_on_network_change: bool,
    pub disconnect_wait_secs: u64,
    pub traffic_window_secs: u64,
    pub traffic_limit_bytes: u64,
    /// How often the default route is checked for network changes
    pub network_poll_secs: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            pause_on_screen_off: false,
            reconnect_on_network_change: true,
            disconnect_wait_secs: 20,
            traffic_window_secs: 60,
            traffic_limit_bytes: 64 * 1024,
            network_poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub use_system_proxy: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            use_system_proxy: true,
        }
    }
}

impl Settings {
    /// `<config dir>/ovpnctl/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("ovpnctl").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::ReadError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that only an embedding application can honor.
    /// Screen events have no source outside a desktop shell.
    pub fn validate_headless(&self) -> Result<(), ConfigError> {
        if self.device.pause_on_screen_off {
            return Err(ConfigError::Unsupported("device.pause_on_screen_off"));
        }
        Ok(())
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.device.network_poll_secs.max(1))
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            pause_on_screen_off: self.device.pause_on_screen_off,
            reconnect_on_network_change: self.device.reconnect_on_network_change,
            disconnect_wait: Duration::from_secs(self.device.disconnect_wait_secs),
            traffic_window: Duration::from_secs(self.device.traffic_window_secs),
            traffic_limit: self.device.traffic_limit_bytes,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            engine_binary: self.engine.binary.clone(),
            runtime_dir: self.engine.runtime_dir.clone(),
            bytecount_interval: self.engine.bytecount_interval,
            verbosity: self.engine.verbosity,
            query_proxy: self.proxy.use_system_proxy,
            monitor: self.monitor_options(),
        }
    }
}
