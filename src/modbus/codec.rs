//! Register decoding: turns a handful of 16-bit registers into the signed
//! 64-bit integer domain that `raw_value` lives in (see §4.2/§9: floats are
//! multiplied into an integer domain so wrap detection and exact arithmetic
//! are uniform across counter and scaled-analog channels).

use crate::core::error::{IngestError, Result};
use crate::core::reading::DataType;

/// `Float32` values are stored as raw_value = round(float * FLOAT_SCALE_FACTOR);
/// the matching channel `scale` of 0.001 recovers the physical unit.
pub const FLOAT_SCALE_FACTOR: f64 = 1000.0;

/// Decodes `registers` (already read off the wire) per `data_type`, producing
/// the signed-64 `raw_value`. `registers.len()` must equal
/// `data_type.register_count()`.
pub fn decode_registers(registers: &[u16], data_type: DataType, device_id: &str) -> Result<i64> {
    let expected = data_type.register_count() as usize;
    if registers.len() != expected {
        return Err(IngestError::decode(
            device_id,
            format!("expected {expected} registers for {data_type:?}, got {}", registers.len()),
        ));
    }

    Ok(match data_type {
        // Low word first: registers[0] is the low 16 bits.
        DataType::UInt32Counter => (((registers[1] as u32) << 16) | registers[0] as u32) as i64,
        DataType::Int16 => registers[0] as i16 as i64,
        DataType::UInt16 => registers[0] as i64,
        DataType::Float32 => {
            let bytes = [
                (registers[0] >> 8) as u8,
                (registers[0] & 0xFF) as u8,
                (registers[1] >> 8) as u8,
                (registers[1] & 0xFF) as u8,
            ];
            let value = f32::from_be_bytes(bytes);
            if !value.is_finite() {
                return Err(IngestError::decode(device_id, format!("non-finite float32 decode: {value}")));
            }
            (value as f64 * FLOAT_SCALE_FACTOR).round() as i64
        }
        // Low word first, signed.
        DataType::Int32 => (((registers[1] as u32) << 16) | registers[0] as u32) as i32 as i64,
    })
}

/// Encodes a `UInt32Counter` value into its low-word-first register pair.
/// Used by tests and by the in-memory Modbus responder fixture.
pub fn encode_uint32_low_first(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Encodes a `Float32` value into its big-endian register pair.
pub fn encode_float32_be(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    let high = ((bytes[0] as u16) << 8) | bytes[1] as u16;
    let low = ((bytes[2] as u16) << 8) | bytes[3] as u16;
    [high, low]
}

/// Encodes an `Int32`/signed low-word-first value, mirroring [`encode_uint32_low_first`].
pub fn encode_int32_low_first(value: i32) -> [u16; 2] {
    encode_uint32_low_first(value as u32)
}
