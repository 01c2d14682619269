//! Typed, validated configuration surface (C11): a single `AppConfig`
//! deserialized from TOML, with the cross-field checks §4.10 requires before
//! anything is wired up.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::IngestError;
use crate::core::reading::{DeviceConfig, MqttDeviceConfig};
use crate::storage::{BatchConfig, DlqConfig};

fn default_true() -> bool {
    true
}
fn default_broker_port() -> u16 {
    1883
}
fn default_keep_alive_s() -> u64 {
    30
}
fn default_reconnect_delay_s() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    0
}
fn default_qos() -> u8 {
    1
}
fn default_max_tracked_topics() -> usize {
    1000
}
fn default_max_json_payload_bytes() -> usize {
    crate::mqtt::decoder::DEFAULT_MAX_JSON_PAYLOAD_BYTES
}
fn default_timescale_port() -> u16 {
    5432
}
fn default_table_name() -> String {
    "readings".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    5000
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_pool_min() -> u32 {
    1
}
fn default_pool_max() -> u32 {
    10
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_disk_warning_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_global_poll_interval_ms() -> u64 {
    1000
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_queue_capacity() -> usize {
    1000
}

/// MQTT broker connection settings (§6 `mqtt.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub allow_invalid_certs: bool,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_reconnect_delay_s")]
    pub reconnect_delay_s: u64,
    /// 0 means retry forever. The event-loop reconnect path (C4) already
    /// retries indefinitely on transport errors, so this is the config
    /// surface's documented default rather than an enforced attempt cap.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_max_tracked_topics")]
    pub max_tracked_topics: usize,
    #[serde(default = "default_max_json_payload_bytes")]
    pub max_json_payload_bytes: usize,
}

/// Time-series store connection and batching settings (§6 `timescale.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescaleSettings {
    pub host: String,
    #[serde(default = "default_timescale_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub dlq_directory: std::path::PathBuf,
    #[serde(default = "default_max_retry_attempts")]
    pub dlq_max_retry_attempts: u32,
    #[serde(default = "default_disk_warning_bytes")]
    pub dlq_disk_warning_bytes: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Top-level application configuration (C11), deserialized from a single TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,
    #[serde(default)]
    pub mqtt_devices: Vec<MqttDeviceConfig>,
    pub timescale: TimescaleSettings,
    #[serde(default = "default_global_poll_interval_ms")]
    pub global_poll_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub demo_mode: bool,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks §4.10 requires before wiring anything up: duplicate
    /// device ids, duplicate channel numbers within a device, and
    /// well-formed IP/ports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_device_ids = HashSet::new();
        for device in &self.devices {
            if !seen_device_ids.insert(device.device_id.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate device_id '{}'", device.device_id)));
            }
            if device.ip == Ipv4Addr::UNSPECIFIED {
                return Err(ConfigError::Validation(format!("device '{}' has an unspecified ip (0.0.0.0)", device.device_id)));
            }
            if device.port == 0 {
                return Err(ConfigError::Validation(format!("device '{}' has port 0", device.device_id)));
            }
            if device.unit_id == 0 {
                return Err(ConfigError::Validation(format!("device '{}' has unit_id 0 (must be 1-255)", device.device_id)));
            }
            if let Some(poll_interval_ms) = device.poll_interval_ms {
                if !(100..=300_000).contains(&poll_interval_ms) {
                    return Err(ConfigError::Validation(format!(
                        "device '{}' has poll_interval_ms {} outside 100-300000",
                        device.device_id, poll_interval_ms
                    )));
                }
            }
            if !(500..=30_000).contains(&device.timeout_ms) {
                return Err(ConfigError::Validation(format!("device '{}' has timeout_ms {} outside 500-30000", device.device_id, device.timeout_ms)));
            }
            if device.max_retries > 10 {
                return Err(ConfigError::Validation(format!("device '{}' has max_retries {} outside 0-10", device.device_id, device.max_retries)));
            }

            let mut seen_channels = HashSet::new();
            for channel in &device.channels {
                if !seen_channels.insert(channel.channel_number) {
                    return Err(ConfigError::Validation(format!(
                        "device '{}' has duplicate channel_number {}",
                        device.device_id, channel.channel_number
                    )));
                }
                if !(1..=4).contains(&channel.register_count) {
                    return Err(ConfigError::Validation(format!(
                        "device '{}' channel {} has register_count {} outside 1-4",
                        device.device_id, channel.channel_number, channel.register_count
                    )));
                }
                if channel.scale <= 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "device '{}' channel {} has non-positive scale {}",
                        device.device_id, channel.channel_number, channel.scale
                    )));
                }
                if !(10..=1800).contains(&channel.rate_window_seconds) {
                    return Err(ConfigError::Validation(format!(
                        "device '{}' channel {} has rate_window_seconds {} outside 10-1800",
                        device.device_id, channel.channel_number, channel.rate_window_seconds
                    )));
                }
            }
        }

        for device in &self.mqtt_devices {
            if !seen_device_ids.insert(device.device_id.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate device_id '{}'", device.device_id)));
            }
            if device.topics.is_empty() {
                return Err(ConfigError::Validation(format!("mqtt device '{}' has no topics configured", device.device_id)));
            }
        }

        if !self.mqtt_devices.is_empty() && self.mqtt.is_none() {
            return Err(ConfigError::Validation("mqtt_devices configured without an [mqtt] broker section".to_string()));
        }

        if self.timescale.table_name.len() > 63 {
            return Err(ConfigError::Validation("timescale.table_name exceeds 63 characters".to_string()));
        }
        if !(1..=1000).contains(&self.timescale.batch_size) {
            return Err(ConfigError::Validation("timescale.batch_size must be between 1 and 1000".to_string()));
        }

        Ok(())
    }

    pub fn mqtt_client_config(&self) -> Option<crate::mqtt::MqttConfig> {
        self.mqtt.as_ref().map(|m| crate::mqtt::MqttConfig {
            broker_host: m.broker_host.clone(),
            broker_port: m.broker_port,
            client_id: m.client_id.clone(),
            username: m.username.clone(),
            password: m.password.clone(),
            use_tls: m.use_tls,
            allow_invalid_certs: m.allow_invalid_certs,
            keep_alive_s: m.keep_alive_s,
            reconnect_delay_s: m.reconnect_delay_s,
            clean_session: m.clean_session,
            qos: m.qos,
        })
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            capacity: self.timescale.queue_capacity,
            batch_size: self.timescale.batch_size,
            batch_timeout_ms: self.timescale.batch_timeout_ms,
        }
    }

    pub fn dlq_config(&self) -> DlqConfig {
        DlqConfig {
            directory: self.timescale.dlq_directory.clone(),
            max_retry_attempts: self.timescale.dlq_max_retry_attempts,
            disk_warning_bytes: self.timescale.dlq_disk_warning_bytes,
        }
    }
}

/// Errors raised loading or validating configuration (C11).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<ConfigError> for IngestError {
    fn from(e: ConfigError) -> Self {
        IngestError::config(e.to_string())
    }
}
