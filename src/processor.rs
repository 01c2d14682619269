//! Data processor (C7): scaling, windowed counter-overflow-aware rate
//! computation, and quality assignment.
//!
//! The processor is the single place raw register/payload decodes become
//! the physical-unit readings the store receives. It is shared by both the
//! Modbus polling path and the MQTT decode path.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::warn;

use crate::core::reading::{ChannelConfig, DataType, DeviceReading, MqttDataType, Tags};

/// Which counter-overflow rule applies to a channel's raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    None,
    U16,
    U32,
}

impl From<DataType> for CounterKind {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::UInt32Counter => Self::U32,
            DataType::UInt16 => Self::U16,
            DataType::Int16 | DataType::Float32 | DataType::Int32 => Self::None,
        }
    }
}

impl From<MqttDataType> for CounterKind {
    fn from(data_type: MqttDataType) -> Self {
        match data_type {
            MqttDataType::UInt32 => Self::U32,
            MqttDataType::UInt16 => Self::U16,
            MqttDataType::Int16 | MqttDataType::Float32 | MqttDataType::Float64 => Self::None,
        }
    }
}

impl CounterKind {
    /// Amount added to the numerator when a wrap is detected (`previous > current`).
    fn wrap_amount(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::U16 => 1i64 << 16,
            Self::U32 => 1i64 << 32,
        }
    }
}

/// Per-channel processing rules, built from either a Modbus `ChannelConfig`
/// or an MQTT `MqttDeviceConfig`.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub scale: f64,
    pub offset: f64,
    pub unit: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub max_change_rate: Option<f64>,
    pub rate_window_seconds: u64,
    pub counter_kind: CounterKind,
}

impl From<&ChannelConfig> for ChannelSpec {
    fn from(cfg: &ChannelConfig) -> Self {
        Self {
            scale: cfg.scale,
            offset: cfg.offset,
            unit: cfg.unit.clone(),
            min: cfg.min,
            max: cfg.max,
            max_change_rate: cfg.max_change_rate,
            rate_window_seconds: cfg.rate_window_seconds,
            counter_kind: cfg.data_type.into(),
        }
    }
}

/// Default window for MQTT channels, which have no configurable window.
const MQTT_RATE_WINDOW_SECONDS: u64 = 60;

struct WindowSample {
    timestamp: DateTime<Utc>,
    raw_value: i64,
    /// Cumulative overflow adjustment applied up to and including this sample.
    cumulative_adjustment: i64,
}

struct RateWindow {
    samples: VecDeque<WindowSample>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Inserts a new sample, evicts stale ones, and returns the rate (in
    /// raw units/second, scale not yet applied) if enough samples remain.
    fn insert_and_rate(&mut self, timestamp: DateTime<Utc>, raw_value: i64, counter_kind: CounterKind, window_seconds: u64) -> Option<f64> {
        let cumulative_adjustment = match self.samples.back() {
            Some(prev) if counter_kind != CounterKind::None && prev.raw_value > raw_value => {
                prev.cumulative_adjustment + counter_kind.wrap_amount()
            }
            Some(prev) => prev.cumulative_adjustment,
            None => 0,
        };

        self.samples.push_back(WindowSample {
            timestamp,
            raw_value,
            cumulative_adjustment,
        });

        let cutoff = timestamp - chrono::Duration::seconds(window_seconds as i64);
        while self
            .samples
            .front()
            .is_some_and(|s| s.timestamp < cutoff && self.samples.len() > 1)
        {
            self.samples.pop_front();
        }

        if self.samples.len() < 2 {
            return None;
        }

        let oldest = self.samples.front().unwrap();
        let latest = self.samples.back().unwrap();
        let dt = (latest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 1000.0;
        if dt < 1.0 {
            return None;
        }

        let adjusted_latest = latest.raw_value + latest.cumulative_adjustment;
        let adjusted_oldest = oldest.raw_value + oldest.cumulative_adjustment;
        Some((adjusted_latest - adjusted_oldest) as f64 / dt)
    }
}

/// Shared C7 processor: applies scale/offset, windowed rate, and quality to
/// raw Modbus/MQTT decodes.
#[derive(Default)]
pub struct DataProcessor {
    channels: DashMap<(String, u8), ChannelSpec>,
    windows: DashMap<(String, u8), RateWindow>,
    warned_unknown: DashSet<(String, u8)>,
}

impl DataProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_modbus_device(&self, device_id: &str, channels: &[ChannelConfig]) {
        for ch in channels {
            self.channels
                .insert((device_id.to_string(), ch.channel_number), ChannelSpec::from(ch));
        }
    }

    pub fn register_mqtt_device(&self, device_id: &str, channel: u8, scale: f64, unit: &str, data_type: MqttDataType) {
        self.channels.insert(
            (device_id.to_string(), channel),
            ChannelSpec {
                scale,
                offset: 0.0,
                unit: unit.to_string(),
                min: None,
                max: None,
                max_change_rate: None,
                rate_window_seconds: MQTT_RATE_WINDOW_SECONDS,
                counter_kind: data_type.into(),
            },
        );
    }

    /// Drops all rate-window and (optionally re-added) channel state for a device.
    pub fn reset_device(&self, device_id: &str) {
        self.windows.retain(|(id, _), _| id != device_id);
        self.channels.retain(|(id, _), _| id != device_id);
    }

    /// Processes a successful raw read into a fully-formed reading.
    pub fn process_success(&self, device_id: &str, channel: u8, timestamp: DateTime<Utc>, raw_value: i64) -> DeviceReading {
        let key = (device_id.to_string(), channel);
        let spec = match self.channels.get(&key) {
            Some(spec) => spec.clone(),
            None => {
                if self.warned_unknown.insert(key.clone()) {
                    warn!(device_id, channel, "reading for unknown device/channel pair, passing through unscaled");
                }
                return DeviceReading {
                    device_id: device_id.to_string(),
                    channel,
                    timestamp,
                    raw_value,
                    processed_value: raw_value as f64,
                    rate: None,
                    quality: crate::core::quality::Quality::Good,
                    unit: String::new(),
                    tags: Tags::new(),
                };
            }
        };

        let processed_value = raw_value as f64 * spec.scale + spec.offset;

        let raw_rate = self
            .windows
            .entry(key)
            .or_insert_with(RateWindow::new)
            .insert_and_rate(timestamp, raw_value, spec.counter_kind, spec.rate_window_seconds);
        let rate = raw_rate.map(|r| r * spec.scale);

        let quality = self.assign_quality(device_id, channel, processed_value, rate, &spec);

        DeviceReading {
            device_id: device_id.to_string(),
            channel,
            timestamp,
            raw_value,
            processed_value,
            rate,
            quality,
            unit: spec.unit.clone(),
            tags: Tags::new(),
        }
    }

    fn assign_quality(&self, device_id: &str, channel: u8, processed_value: f64, rate: Option<f64>, spec: &ChannelSpec) -> crate::core::quality::Quality {
        use crate::core::quality::Quality;

        let out_of_bounds = spec.min.is_some_and(|m| processed_value < m) || spec.max.is_some_and(|m| processed_value > m);
        if out_of_bounds {
            warn!(device_id, channel, processed_value, "reading out of configured bounds");
            return Quality::Bad;
        }

        if let (Some(limit), Some(r)) = (spec.max_change_rate, rate) {
            if r.abs() > limit {
                warn!(device_id, channel, rate = r, limit, "reading exceeded max change rate");
                return Quality::Degraded;
            }
        }

        Quality::Good
    }

    /// Processes a terminal read/decode failure. Never touches the rate window.
    pub fn process_failure(&self, device_id: &str, channel: u8, timestamp: DateTime<Utc>, error: impl Into<String>) -> DeviceReading {
        DeviceReading::unavailable(device_id, channel, timestamp, error)
    }
}
