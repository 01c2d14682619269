//! Modbus Application Protocol (MBAP) framing.
//!
//! Builds and parses the 7-byte header used to carry a Modbus PDU over TCP,
//! and the thin read-request/read-response PDU shapes this client needs
//! (function codes 0x03/0x04 only - this service is a client, read-only).

use std::sync::atomic::{AtomicU16, Ordering};

use crate::core::error::{IngestError, Result};

/// Per-connection transaction-id generator. Wraps at `u16::MAX`, skipping 0
/// (0 is a valid MBAP transaction id per the spec, but several PLC
/// firmwares special-case it, so this codebase's ancestry steers clear of
/// it like every other client in the corpus).
pub struct TransactionIdGen(AtomicU16);

impl TransactionIdGen {
    pub fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    pub fn next(&self) -> u16 {
        let id = self.0.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            self.0.fetch_add(1, Ordering::SeqCst)
        } else {
            id
        }
    }
}

impl Default for TransactionIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the 7-byte MBAP header for a PDU of the given length.
pub fn build_mbap(transaction_id: u16, unit_id: u8, pdu_len: usize) -> [u8; 7] {
    let length = (pdu_len + 1) as u16; // PDU + unit_id byte
    [
        (transaction_id >> 8) as u8,
        (transaction_id & 0xFF) as u8,
        0x00, // protocol id high (always 0 for Modbus)
        0x00, // protocol id low
        (length >> 8) as u8,
        (length & 0xFF) as u8,
        unit_id,
    ]
}

/// Builds a full MBAP + PDU frame requesting `count` registers of `function_code`
/// starting at `start`.
pub fn build_read_request(transaction_id: u16, unit_id: u8, function_code: u8, start: u16, count: u16) -> Vec<u8> {
    let pdu = [
        function_code,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ];
    let mbap = build_mbap(transaction_id, unit_id, pdu.len());
    let mut frame = Vec::with_capacity(mbap.len() + pdu.len());
    frame.extend_from_slice(&mbap);
    frame.extend_from_slice(&pdu);
    frame
}

/// Parses the MBAP header, returning `(transaction_id, unit_id, pdu_slice)`.
pub fn parse_mbap(data: &[u8], device_id: &str) -> Result<(u16, u8, &[u8])> {
    if data.len() < 8 {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: format!("response too short: {} bytes", data.len()),
        });
    }
    let transaction_id = ((data[0] as u16) << 8) | (data[1] as u16);
    let protocol_id = ((data[2] as u16) << 8) | (data[3] as u16);
    let length = ((data[4] as u16) << 8) | (data[5] as u16);
    let unit_id = data[6];

    if protocol_id != 0 {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: format!("unexpected protocol id {protocol_id}"),
        });
    }
    let expected_total = 6 + length as usize;
    if data.len() < expected_total {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: format!("truncated frame: header claims {expected_total} bytes, got {}", data.len()),
        });
    }

    Ok((transaction_id, unit_id, &data[7..expected_total]))
}

/// Outcome of a successfully-framed read response PDU.
pub struct ReadResponse {
    pub registers: Vec<u16>,
}

/// Parses a read-holding/input-registers response PDU, raising a
/// [`IngestError::ModbusException`] if the server signalled an exception
/// (high bit of the function-code byte set).
pub fn parse_read_response(pdu: &[u8], device_id: &str, function_code: u8) -> Result<ReadResponse> {
    if pdu.is_empty() {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: "empty PDU".to_string(),
        });
    }

    if pdu[0] & 0x80 != 0 {
        let exception_code = *pdu.get(1).unwrap_or(&0);
        return Err(IngestError::modbus_exception(device_id, pdu[0] & 0x7F, exception_code));
    }

    if pdu[0] != function_code {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: format!("unexpected function code 0x{:02x}, expected 0x{:02x}", pdu[0], function_code),
        });
    }

    let byte_count = *pdu.get(1).ok_or_else(|| IngestError::InvalidFrame {
        device_id: device_id.to_string(),
        message: "missing byte count".to_string(),
    })? as usize;

    if pdu.len() < 2 + byte_count {
        return Err(IngestError::InvalidFrame {
            device_id: device_id.to_string(),
            message: "byte count exceeds PDU length".to_string(),
        });
    }

    let mut registers = Vec::with_capacity(byte_count / 2);
    for chunk in pdu[2..2 + byte_count].chunks_exact(2) {
        registers.push(((chunk[0] as u16) << 8) | (chunk[1] as u16));
    }
    Ok(ReadResponse { registers })
}
