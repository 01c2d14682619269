//! MQTT ingest: broker connection (C4), topic routing (C5), and payload
//! decoding (C6).

pub mod client;
pub mod decoder;
pub mod topics;

pub use client::{InboundMessage, MqttClient, MqttConfig};
pub use topics::TopicSubscriptions;
