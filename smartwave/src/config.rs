//! Configuration for a SmartWave connection.
//!
//! Every field has a default matching the stock device, so an empty JSON
//! object is a valid configuration. Timeouts can additionally be overridden
//! through `SMARTWAVE_*` environment variables, which take precedence over
//! the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::TriggerMode;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Transport and handshake behavior
    pub connection: ConnectionConfig,

    /// Pool sizes of the device inventory
    pub resources: ResourceConfig,

    /// Firmware and bitstream upload
    pub update: UpdateConfig,
}

/// Transport and handshake settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub baud_rate: u32,

    /// Default deadline for a request's reply
    pub reply_timeout_ms: u64,

    /// Host heartbeat interval; no keepalive when absent
    pub keepalive_interval_ms: Option<u64>,

    /// Send a Reset request during the handshake
    pub reset_on_connect: bool,

    /// Write general configuration during the handshake
    pub configure_on_connect: bool,

    /// IO voltage written by the handshake
    pub vddio: f32,

    pub trigger_mode: TriggerMode,

    /// Buffered events per subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            reply_timeout_ms: 1000,
            keepalive_interval_ms: None,
            reset_on_connect: true,
            configure_on_connect: true,
            vddio: 3.3,
            trigger_mode: TriggerMode::Single,
            event_capacity: 64,
        }
    }
}

/// Number of hardware blocks of each kind the device offers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub i2c_drivers: u8,
    pub spi_drivers: u8,
    pub gpio_drivers: u8,
    pub uart_drivers: u8,
    pub stimuli: u8,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            i2c_drivers: 2,
            spi_drivers: 2,
            gpio_drivers: 16,
            uart_drivers: 0,
            stimuli: 4,
        }
    }
}

/// Update transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Image bytes per chunk frame
    pub chunk_size: usize,

    pub bootloader_timeout_ms: u64,
    pub chunk_timeout_ms: u64,
    pub verify_timeout_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            bootloader_timeout_ms: 5000,
            chunk_timeout_ms: 2000,
            verify_timeout_ms: 10_000,
        }
    }
}

fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

impl Config {
    /// Load configuration from a JSON file and apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)?;
        config.with_env_overrides().validated()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `SMARTWAVE_REPLY_TIMEOUT_MS`, `SMARTWAVE_KEEPALIVE_MS` and
    /// `SMARTWAVE_CHUNK_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_millis("SMARTWAVE_REPLY_TIMEOUT_MS") {
            self.connection.reply_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("SMARTWAVE_KEEPALIVE_MS") {
            self.connection.keepalive_interval_ms = (ms > 0).then_some(ms);
        }
        if let Some(ms) = env_millis("SMARTWAVE_CHUNK_TIMEOUT_MS") {
            self.update.chunk_timeout_ms = ms;
        }
        self
    }

    /// Reject settings the device cannot honor.
    pub fn validated(self) -> Result<Self> {
        if !(MIN_VDDIO..=MAX_VDDIO).contains(&self.connection.vddio) {
            return Err(Error::Config(format!(
                "vddio {:.2} V outside {:.1}-{:.1} V",
                self.connection.vddio, MIN_VDDIO, MAX_VDDIO
            )));
        }
        if self.update.chunk_size == 0 || self.update.chunk_size > MAX_CHUNK {
            return Err(Error::Config(format!(
                "update chunk size {} outside 1-{}",
                self.update.chunk_size, MAX_CHUNK
            )));
        }
        if self.resources.gpio_drivers > 16 {
            return Err(Error::Config(
                "more GPIO drivers than the device has pins".into(),
            ));
        }
        Ok(self)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.reply_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.connection
            .keepalive_interval_ms
            .map(Duration::from_millis)
    }
}

pub const MIN_VDDIO: f32 = 1.8;
pub const MAX_VDDIO: f32 = 5.0;

// Chunk frame payload is a sub-command byte, a 4 byte offset and the data.
const MAX_CHUNK: usize = crate::protocol::frame::MAX_PAYLOAD - 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.connection.baud_rate, 115_200);
        assert_eq!(config.resources.i2c_drivers, 2);
        assert_eq!(config.resources.stimuli, 4);
        assert_eq!(config.keepalive_interval(), None);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = Config::from_json(
            r#"{
                "connection": { "keepalive_interval_ms": 500, "trigger_mode": "toggle" },
                "resources": { "uart_drivers": 1 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.keepalive_interval(), Some(Duration::from_millis(500)));
        assert_eq!(config.connection.trigger_mode, TriggerMode::Toggle);
        assert_eq!(config.connection.reply_timeout_ms, 1000);
        assert_eq!(config.resources.uart_drivers, 1);
        assert_eq!(config.resources.spi_drivers, 2);
    }

    #[test]
    fn bad_json_is_config_error() {
        assert!(matches!(
            Config::from_json("{ nope"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_vddio() {
        let mut config = Config::default();
        config.connection.vddio = 6.0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn rejects_zero_chunk() {
        let mut config = Config::default();
        config.update.chunk_size = 0;
        assert!(config.validated().is_err());
    }
}
