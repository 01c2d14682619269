//! Payload decoder (C6): turns a raw MQTT payload into a decoded sample,
//! per the matched device's configured format. Scaling and quality are the
//! processor's job (§4.6) - this module only extracts `(channel, raw_value,
//! timestamp)`.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::core::error::{IngestError, Result};
use crate::core::reading::{MqttDataType, MqttDeviceConfig, MqttFormat};
use crate::modbus::codec::FLOAT_SCALE_FACTOR;

pub const DEFAULT_MAX_JSON_PAYLOAD_BYTES: usize = 1024 * 1024;

/// A decoded MQTT sample, ready to hand to the data processor.
pub struct DecodedSample {
    pub device_id: String,
    pub channel: u8,
    pub timestamp: DateTime<Utc>,
    pub raw_value: i64,
}

pub fn decode(config: &MqttDeviceConfig, payload: &[u8], received_at: DateTime<Utc>, max_json_payload_bytes: usize) -> Result<DecodedSample> {
    match config.format {
        MqttFormat::Json => decode_json(config, payload, received_at, max_json_payload_bytes),
        MqttFormat::Binary => decode_binary(config, payload, received_at),
        MqttFormat::Csv => decode_csv(config, payload, received_at),
    }
}

/// Resolves a dotted path (`"data.value"`) against a JSON value.
fn resolve_path<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn decode_json(config: &MqttDeviceConfig, payload: &[u8], received_at: DateTime<Utc>, max_json_payload_bytes: usize) -> Result<DecodedSample> {
    if payload.len() > max_json_payload_bytes {
        return Err(IngestError::decode(
            &config.device_id,
            format!("json payload of {} bytes exceeds the {max_json_payload_bytes}-byte cap", payload.len()),
        ));
    }

    let root: JsonValue = serde_json::from_slice(payload).map_err(|e| IngestError::decode(&config.device_id, format!("invalid_json: {e}")))?;

    let device_id = config
        .device_id_path
        .as_deref()
        .and_then(|p| resolve_path(&root, p))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| config.device_id.clone());

    let channel = config
        .channel_path
        .as_deref()
        .and_then(|p| resolve_path(&root, p))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u8;

    let value_path = config.value_path.as_deref().ok_or_else(|| IngestError::decode(&config.device_id, "no value_path configured"))?;
    let value = resolve_path(&root, value_path)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| IngestError::decode(&config.device_id, format!("missing or non-numeric value at '{value_path}'")))?;

    let timestamp = config
        .timestamp_path
        .as_deref()
        .and_then(|p| resolve_path(&root, p))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(received_at);

    Ok(DecodedSample {
        device_id,
        channel,
        timestamp,
        raw_value: numeric_to_raw(config.data_type, value, &config.device_id)?,
    })
}

fn decode_binary(config: &MqttDeviceConfig, payload: &[u8], received_at: DateTime<Utc>) -> Result<DecodedSample> {
    let width = config.data_type.byte_width();

    let (channel, value_bytes) = if payload.len() == width {
        (0u8, payload)
    } else if payload.len() == width + 1 {
        (payload[0], &payload[1..])
    } else {
        return Err(IngestError::decode(
            &config.device_id,
            format!("binary payload of {} bytes does not match {width} or {} bytes", payload.len(), width + 1),
        ));
    };

    let raw_value = match config.data_type {
        MqttDataType::UInt32 => u32::from_be_bytes(value_bytes.try_into().unwrap()) as i64,
        MqttDataType::Int16 => i16::from_be_bytes(value_bytes.try_into().unwrap()) as i64,
        MqttDataType::UInt16 => u16::from_be_bytes(value_bytes.try_into().unwrap()) as i64,
        MqttDataType::Float32 => {
            let v = f32::from_be_bytes(value_bytes.try_into().unwrap());
            (v as f64 * FLOAT_SCALE_FACTOR).round() as i64
        }
        MqttDataType::Float64 => {
            let v = f64::from_be_bytes(value_bytes.try_into().unwrap());
            (v * FLOAT_SCALE_FACTOR).round() as i64
        }
    };

    Ok(DecodedSample {
        device_id: config.device_id.clone(),
        channel,
        timestamp: received_at,
        raw_value,
    })
}

fn decode_csv(config: &MqttDeviceConfig, payload: &[u8], received_at: DateTime<Utc>) -> Result<DecodedSample> {
    let text = std::str::from_utf8(payload).map_err(|e| IngestError::decode(&config.device_id, format!("non-utf8 csv payload: {e}")))?;

    let mut reader = csv::ReaderBuilder::new().has_headers(false).trim(csv::Trim::All).from_reader(text.trim().as_bytes());

    let record = reader
        .records()
        .next()
        .ok_or_else(|| IngestError::decode(&config.device_id, "empty csv payload"))?
        .map_err(|e| IngestError::decode(&config.device_id, format!("malformed csv record: {e}")))?;

    let (channel_field, value_field, timestamp_field) = match record.len() {
        1 => (None, record.get(0), None),
        2 => (None, record.get(0), record.get(1)),
        3 => (record.get(0), record.get(1), record.get(2)),
        n => return Err(IngestError::decode(&config.device_id, format!("csv record has unsupported field count {n}"))),
    };

    // A 2-field record is ambiguous between `value,timestamp` and
    // `channel,value`; per §4.6 the 2-field form is always `value,timestamp`.
    let channel = channel_field
        .map(|s| s.parse::<u8>().map_err(|e| IngestError::decode(&config.device_id, format!("invalid channel field: {e}"))))
        .transpose()?
        .unwrap_or(0);

    let value: f64 = value_field
        .ok_or_else(|| IngestError::decode(&config.device_id, "missing value field"))?
        .parse()
        .map_err(|e| IngestError::decode(&config.device_id, format!("invalid value field: {e}")))?;

    let timestamp = timestamp_field
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(received_at);

    Ok(DecodedSample {
        device_id: config.device_id.clone(),
        channel,
        timestamp,
        raw_value: numeric_to_raw(config.data_type, value, &config.device_id)?,
    })
}

fn numeric_to_raw(data_type: MqttDataType, value: f64, device_id: &str) -> Result<i64> {
    if !value.is_finite() {
        return Err(IngestError::decode(device_id, format!("non-finite decoded value: {value}")));
    }
    Ok(match data_type {
        MqttDataType::UInt32 => value as i64,
        MqttDataType::Int16 => value as i64,
        MqttDataType::UInt16 => value as i64,
        MqttDataType::Float32 | MqttDataType::Float64 => (value * FLOAT_SCALE_FACTOR).round() as i64,
    })
}
