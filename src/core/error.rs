//! Crate-wide error taxonomy for the ingest pipeline.

use thiserror::Error;

/// A specialized Result type for ingest operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// The error type shared by every component in the pipeline (C1-C10).
///
/// Variants are grouped by category so call sites can branch on
/// [`IngestError::is_retryable`] / [`IngestError::needs_reconnect`] rather
/// than matching on the concrete variant.
#[derive(Debug, Error)]
pub enum IngestError {
    // === Connection errors (transient) ===
    /// TCP/broker connection failed.
    #[error("connection error ({device_id}): {message}")]
    Connection { device_id: String, message: String },

    /// Not connected to the target.
    #[error("not connected: {device_id}")]
    NotConnected { device_id: String },

    /// Operation timed out.
    #[error("timeout after {timeout_ms}ms ({device_id})")]
    Timeout { device_id: String, timeout_ms: u64 },

    /// Connection attempted before the throttle interval elapsed.
    #[error("connect throttled ({device_id})")]
    Throttled { device_id: String },

    // === Protocol errors ===
    /// Modbus exception response (permanent, not retried).
    #[error("modbus exception 0x{exception_code:02x} from {device_id} (function 0x{function_code:02x})")]
    ModbusException {
        device_id: String,
        function_code: u8,
        exception_code: u8,
    },

    /// Malformed MBAP/PDU frame.
    #[error("invalid frame from {device_id}: {message}")]
    InvalidFrame { device_id: String, message: String },

    // === Data errors ===
    /// Payload could not be decoded.
    #[error("decode error ({device_id}): {message}")]
    Decode { device_id: String, message: String },

    /// A decoded or configured value was out of range / malformed.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    // === Configuration errors (permanent, abort startup) ===
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    // === I/O errors ===
    /// Underlying std I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // === Resource errors ===
    /// DLQ directory has exhausted available disk space.
    #[error("dead-letter queue disk full: {0}")]
    DiskFull(String),

    /// Bounded channel rejected an item (reported, never silent).
    #[error("queue full: {0}")]
    QueueFull(String),

    // === Internal / cancellation ===
    /// Programmer error / invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation was cancelled during shutdown; not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    /// Whether reconnecting the underlying transport is required before retrying.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotConnected { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Whether the caller's retry policy should attempt this operation again.
    ///
    /// Mirrors the source taxonomy (see spec): transient failures are
    /// retryable, permanent/resource/cancellation failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotConnected { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Whether this is a permanent (non-retryable-by-definition) protocol error.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ModbusException { .. } | Self::InvalidFrame { .. } | Self::Config(_)
        )
    }

    pub fn connection(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    pub fn timeout(device_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            device_id: device_id.into(),
            timeout_ms,
        }
    }

    pub fn modbus_exception(device_id: impl Into<String>, function_code: u8, exception_code: u8) -> Self {
        Self::ModbusException {
            device_id: device_id.into(),
            function_code,
            exception_code,
        }
    }

    pub fn decode(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_reconnect_matches_transient_variants() {
        assert!(IngestError::connection("d1", "refused").needs_reconnect());
        assert!(IngestError::timeout("d1", 500).needs_reconnect());
        assert!(!IngestError::modbus_exception("d1", 0x03, 0x02).needs_reconnect());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!IngestError::modbus_exception("d1", 0x03, 0x02).is_retryable());
        assert!(!IngestError::config("bad").is_retryable());
        assert!(IngestError::connection("d1", "refused").is_retryable());
    }

    #[test]
    fn is_permanent_flags_protocol_and_config_errors() {
        assert!(IngestError::modbus_exception("d1", 0x03, 0x02).is_permanent());
        assert!(IngestError::config("bad").is_permanent());
        assert!(!IngestError::timeout("d1", 500).is_permanent());
    }
}
