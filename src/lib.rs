//! # daq-ingest
//!
//! The ingest core of an industrial data-acquisition service: it polls
//! heterogeneous field devices over Modbus/TCP and MQTT, normalizes their
//! readings (scaling, counter-overflow-aware rate, quality assignment), and
//! persists them to a time-series store in batches with a disk-backed
//! dead-letter queue for zero-data-loss under store outages.
//!
//! ## Layout
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`health`] | Per-device success/failure tracking |
//! | [`modbus`] | Modbus/TCP connection lifecycle, framing, and the device poll pool |
//! | [`mqtt`] | MQTT broker connection, topic routing, payload decoding |
//! | [`processor`] | Scaling, windowed rate, quality assignment |
//! | [`storage`] | Batched writes to the time-series store, plus the dead-letter queue |
//! | [`orchestrator`] | Wires everything together and owns the pipeline's lifecycle |
//! | [`config`] | Typed, validated configuration surface |
//!
//! The time-series store itself is an external collaborator, modeled here
//! as the [`storage::TimeSeriesStore`] trait.

pub mod config;
pub mod core;
pub mod health;
pub mod modbus;
pub mod mqtt;
pub mod orchestrator;
pub mod processor;
pub mod storage;

/// Convenience re-exports for embedding applications.
pub mod prelude {
    pub use crate::config::{AppConfig, ConfigError};
    pub use crate::core::error::{IngestError, Result};
    pub use crate::core::quality::Quality;
    pub use crate::core::reading::{ChannelConfig, DataType, DeviceConfig, DeviceReading, MqttDataType, MqttDeviceConfig, MqttFormat};
    pub use crate::orchestrator::{Orchestrator, Status};
    pub use crate::storage::{BatchWriter, DeadLetterQueue, DemoStore, TimeSeriesStore};
}

pub use crate::core::error::{IngestError, Result};
pub use crate::orchestrator::Orchestrator;
