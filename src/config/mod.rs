//! JSON configuration for a TRK connection.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceOptions;
use crate::serial::interface::DEFAULT_BAUD_RATE;
use crate::starter::bluetooth::{BluetoothListener, DEFAULT_BINARY, DEFAULT_CHANNEL};
use crate::starter::{CommunicationStarter, ListenerMode, Openable, ResourceHook, DEFAULT_INTERVAL};

#[cfg(windows)]
pub const DEFAULT_DEVICE: &str = "COM1";
#[cfg(not(windows))]
pub const DEFAULT_DEVICE: &str = "/dev/rfcomm0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrkConfig {
    pub device: String,
    pub baud_rate: u32,
    pub serial_frame: bool,
    pub verbose: u8,
    pub auto_ack: bool,
    pub starter: StarterConfig,
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarterConfig {
    pub interval_ms: u64,
    /// Absent or null retries forever.
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub binary: String,
    pub mode: ListenerMode,
    pub channel: u8,
}

impl Default for TrkConfig {
    fn default() -> Self {
        let options = DeviceOptions::default();
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            serial_frame: options.serial_frame,
            verbose: options.verbose,
            auto_ack: options.auto_ack,
            starter: StarterConfig::default(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

impl Default for StarterConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            attempts: None,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: DEFAULT_BINARY.to_string(),
            mode: ListenerMode::Listen,
            channel: DEFAULT_CHANNEL,
        }
    }
}

impl TrkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&content)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            baud_rate: self.baud_rate,
            serial_frame: self.serial_frame,
            verbose: self.verbose,
            auto_ack: self.auto_ack,
        }
    }
}

impl StarterConfig {
    pub fn apply<D: Openable, H: ResourceHook>(&self, starter: &mut CommunicationStarter<D, H>) {
        starter.set_interval_ms(self.interval_ms);
        starter.set_attempts(self.attempts);
    }
}

impl BluetoothConfig {
    pub fn listener(&self) -> BluetoothListener {
        BluetoothListener::new(self.mode)
            .with_binary(self.binary.clone())
            .with_channel(self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = TrkConfig::from_json(r#"{ "device": "/dev/ttyUSB1", "serial_frame": true }"#).unwrap();
        assert_eq!(config.device, "/dev/ttyUSB1");
        assert!(config.serial_frame);
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.starter.interval_ms, 1000);
        assert_eq!(config.starter.attempts, None);
        assert!(config.auto_ack);
        assert!(!config.bluetooth.enabled);
    }

    #[test]
    fn test_nested_sections() {
        let config = TrkConfig::from_json(
            r#"{
                "starter": { "interval_ms": 250, "attempts": 20 },
                "bluetooth": { "enabled": true, "mode": "watch", "channel": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.starter.attempts, Some(20));
        assert_eq!(config.bluetooth.mode, ListenerMode::Watch);
        assert_eq!(config.bluetooth.binary, "rfcomm");
        assert_eq!(config.bluetooth.listener().mode(), ListenerMode::Watch);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "verbose": 2, "baud_rate": 230400 }}"#).unwrap();
        let config = TrkConfig::load(file.path()).unwrap();
        let options = config.device_options();
        assert_eq!(options.verbose, 2);
        assert_eq!(options.baud_rate, 230400);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        assert!(matches!(TrkConfig::from_json("{ device: }"), Err(ConfigError::Parse(_))));
        assert!(matches!(TrkConfig::load("/nonexistent/trk.json"), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = TrkConfig::default();
        assert_eq!(TrkConfig::from_json(&config.to_json().unwrap()).unwrap(), config);
    }
}
