//! Modbus/TCP ingest: connection lifecycle (C2), wire framing, register
//! decoding, and the per-device polling pool (C3).

pub mod codec;
pub mod connection;
pub mod frame;
pub mod pool;

pub use connection::ModbusConnection;
pub use pool::DevicePool;
