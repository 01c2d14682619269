//! The ingest pipeline's data model: readings and the device/channel
//! configuration that describes how to obtain them.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::quality::Quality;

/// An ordered string -> string map, preserved in insertion order.
///
/// Readings carry a handful of tags (`device_id`, `error`, operator-defined
/// extras); a small `Vec` scanned linearly is both simpler and faster here
/// than a hash map, and keeps JSON output field order stable for operators
/// tailing the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a tag, preserving its original position on update.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Tags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Tags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map = indexed_map::OrderedStringMap::deserialize(deserializer)?;
        Ok(Tags(map.0))
    }
}

/// Helper module so `Tags`'s `Deserialize` impl can reuse serde_json's
/// default object-preserves-insertion-order behavior without pulling in a
/// dependency solely for this.
mod indexed_map {
    use serde::Deserialize;

    pub struct OrderedStringMap(pub Vec<(String, String)>);

    impl<'de> Deserialize<'de> for OrderedStringMap {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let map = serde_json::Map::deserialize(deserializer).map_err(serde::de::Error::custom)?;
            let mut out = Vec::with_capacity(map.len());
            for (k, v) in map {
                let v = v.as_str().unwrap_or_default().to_string();
                out.push((k, v));
            }
            Ok(OrderedStringMap(out))
        }
    }
}

/// An immutable, fully-normalized device reading.
///
/// Produced by the data processor (`crate::processor`) from a raw Modbus
/// decode or an MQTT payload decode. Once emitted it is never mutated;
/// downstream consumers (the batching pipeline) only ever clone or move it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub channel: u8,
    pub timestamp: DateTime<Utc>,
    /// Faithful integer-normalized decode of the device bytes.
    pub raw_value: i64,
    /// `raw_value * scale + offset`.
    pub processed_value: f64,
    /// Units per second; absent for first reading, non-Good quality, or an
    /// insufficiently populated rate window.
    pub rate: Option<f64>,
    pub quality: Quality,
    pub unit: String,
    pub tags: Tags,
}

impl DeviceReading {
    /// Construct an Unavailable reading for a failed read/decode. Per the
    /// spec's regulatory-transparency invariant this is the *only* way a
    /// gap in the data should ever be represented - never a synthesized
    /// value of any kind.
    pub fn unavailable(device_id: impl Into<String>, channel: u8, timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            timestamp,
            raw_value: 0,
            processed_value: 0.0,
            rate: None,
            quality: Quality::Unavailable,
            unit: String::new(),
            tags: Tags::new().with("error", error),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }
}

/// Modbus register bank a channel is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    /// Function code 0x03.
    Holding,
    /// Function code 0x04.
    Input,
}

impl RegisterType {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Holding => 0x03,
            Self::Input => 0x04,
        }
    }
}

/// Wire encoding of a channel's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Two registers, low word first; wraps at 2^32 (counter semantics).
    UInt32Counter,
    Int16,
    UInt16,
    /// Two registers, big-endian byte order, IEEE-754; stored x1000 as an
    /// integer raw_value (scale 0.001 recovers the unit).
    Float32,
    /// Two registers, low word first.
    Int32,
}

impl DataType {
    /// Number of 16-bit registers this data type occupies.
    pub fn register_count(&self) -> u8 {
        match self {
            Self::Int16 | Self::UInt16 => 1,
            Self::UInt32Counter | Self::Float32 | Self::Int32 => 2,
        }
    }
}

fn default_port() -> u16 {
    502
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_rate_window_seconds() -> u64 {
    60
}

/// Configuration for one Modbus/TCP device (§3 `DeviceConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub ip: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub unit_id: u8,
    /// Falls back to the top-level `global_poll_interval_ms` (§6) when a
    /// device doesn't set its own; resolved by [`crate::config::AppConfig`]
    /// before a device reaches the pool.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_timeout_ms() -> u64 {
    3000
}

/// Configuration for one channel on a Modbus device (§3 `ChannelConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_number: u8,
    pub start_register: u16,
    pub register_count: u8,
    pub register_type: RegisterType,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub max_change_rate: Option<f64>,
    #[serde(default = "default_rate_window_seconds")]
    pub rate_window_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

/// MQTT-published payload format (§3 `MqttDeviceConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttFormat {
    Json,
    Binary,
    Csv,
}

/// Value encoding inside an MQTT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttDataType {
    UInt32,
    Int16,
    UInt16,
    Float32,
    Float64,
}

impl MqttDataType {
    /// Byte width of the binary-format value field.
    pub fn byte_width(&self) -> usize {
        match self {
            Self::Int16 | Self::UInt16 => 2,
            Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Configuration for one MQTT-published device (§3 `MqttDeviceConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttDeviceConfig {
    pub device_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub topics: Vec<String>,
    pub format: MqttFormat,
    pub data_type: MqttDataType,
    #[serde(default)]
    pub qos: Option<u8>,
    #[serde(default)]
    pub device_id_path: Option<String>,
    #[serde(default)]
    pub channel_path: Option<String>,
    #[serde(default)]
    pub value_path: Option<String>,
    #[serde(default)]
    pub timestamp_path: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_preserve_insertion_order() {
        let tags = Tags::new().with("b", "2").with("a", "1");
        let collected: Vec<_> = tags.iter().collect();
        assert_eq!(collected, vec![("b", "2"), ("a", "1")]);
    }

    #[test]
    fn tags_update_in_place() {
        let mut tags = Tags::new().with("a", "1");
        tags.insert("a", "2");
        assert_eq!(tags.get("a"), Some("2"));
        assert_eq!(tags.iter().count(), 1);
    }

    #[test]
    fn unavailable_reading_has_no_rate_and_carries_error_tag() {
        let r = DeviceReading::unavailable("dev1", 3, Utc::now(), "timeout");
        assert!(r.rate.is_none());
        assert_eq!(r.quality, Quality::Unavailable);
        assert_eq!(r.tags.get("error"), Some("timeout"));
    }

    #[test]
    fn data_type_register_counts_match_wire_layout() {
        assert_eq!(DataType::Int16.register_count(), 1);
        assert_eq!(DataType::UInt32Counter.register_count(), 2);
        assert_eq!(DataType::Float32.register_count(), 2);
    }
}
