//! Modbus connection (C2): one TCP socket per device, owned exclusively by
//! that device's polling task.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::{IngestError, Result};
use crate::core::reading::RegisterType;
use crate::modbus::frame::{self, TransactionIdGen};

/// Minimum interval between connection attempts.
const THROTTLE_INTERVAL: Duration = Duration::from_secs(5);
/// How long to wait after closing a socket before reusing the local port,
/// avoiding `EADDRINUSE` on a fast reconnect.
const DISCONNECT_SETTLE: Duration = Duration::from_millis(100);
/// TCP keep-alive idle time once a connection is established.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Owns exactly one TCP connection to one Modbus/TCP device.
///
/// Not `Clone`, not shared: the device pool hands out one of these per
/// device and only ever touches it from that device's polling task.
pub struct ModbusConnection {
    device_id: String,
    addr: SocketAddr,
    unit_id: u8,
    timeout: Duration,
    max_retries: u32,
    keep_alive: bool,
    state: Mutex<ConnState>,
    stream: Mutex<Option<TcpStream>>,
    last_attempt: Mutex<Option<Instant>>,
    txn: TransactionIdGen,
}

impl ModbusConnection {
    pub fn new(device_id: impl Into<String>, addr: SocketAddr, unit_id: u8, timeout: Duration, max_retries: u32, keep_alive: bool) -> Self {
        Self {
            device_id: device_id.into(),
            addr,
            unit_id,
            timeout,
            max_retries,
            keep_alive,
            state: Mutex::new(ConnState::Disconnected),
            stream: Mutex::new(None),
            last_attempt: Mutex::new(None),
            txn: TransactionIdGen::new(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.lock().await == ConnState::Connected
    }

    /// Opens the TCP socket, subject to the 5-second throttle.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut last = self.last_attempt.lock().await;
            if let Some(t) = *last {
                if t.elapsed() < THROTTLE_INTERVAL {
                    return Err(IngestError::Throttled {
                        device_id: self.device_id.clone(),
                    });
                }
            }
            *last = Some(Instant::now());
        }

        *self.state.lock().await = ConnState::Connecting;
        match self.open_socket().await {
            Ok(stream) => {
                *self.stream.lock().await = Some(stream);
                *self.state.lock().await = ConnState::Connected;
                debug!(device_id = %self.device_id, addr = %self.addr, "modbus connected");
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = ConnState::Disconnected;
                warn!(device_id = %self.device_id, error = %e, "modbus connect failed");
                Err(e)
            }
        }
    }

    async fn open_socket(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| IngestError::timeout(&self.device_id, self.timeout.as_millis() as u64))?
            .map_err(|e| IngestError::connection(&self.device_id, e.to_string()))?;

        stream.set_nodelay(true).ok();
        if self.keep_alive {
            let sock_ref = SockRef::from(&stream);
            let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
            let _ = sock_ref.set_tcp_keepalive(&keepalive);
        }
        Ok(stream)
    }

    /// Reads `count` consecutive registers of `register_type` starting at
    /// `start`, retrying transient failures with exponential backoff. A
    /// Modbus exception response is permanent and fails immediately.
    pub async fn read_registers(&self, start: u16, count: u8, register_type: RegisterType) -> Result<Vec<u16>> {
        let mut attempt = 0u32;
        loop {
            match self.try_read_once(start, count, register_type).await {
                Ok(registers) => return Ok(registers),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_retries {
                        self.fail_connection().await;
                        return Err(e);
                    }
                    let backoff_ms = (1000u64 << attempt).min(30_000);
                    warn!(
                        device_id = %self.device_id,
                        attempt,
                        backoff_ms,
                        error = %e,
                        "modbus read failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_read_once(&self, start: u16, count: u8, register_type: RegisterType) -> Result<Vec<u16>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| IngestError::NotConnected {
            device_id: self.device_id.clone(),
        })?;

        let transaction_id = self.txn.next();
        let function_code = register_type.function_code();
        let frame = frame::build_read_request(transaction_id, self.unit_id, function_code, start, count as u16);

        self.write_with_timeout(stream, &frame).await?;

        let mut header = [0u8; 7];
        self.read_exact_with_timeout(stream, &mut header).await?;
        let length = ((header[4] as u16) << 8) | header[5] as u16;
        let pdu_len = (length as usize).saturating_sub(1);
        let mut pdu = vec![0u8; pdu_len];
        self.read_exact_with_timeout(stream, &mut pdu).await?;

        let mut full = Vec::with_capacity(header.len() + pdu.len());
        full.extend_from_slice(&header);
        full.extend_from_slice(&pdu);

        let (resp_txn, _unit_id, pdu_slice) = frame::parse_mbap(&full, &self.device_id)?;
        if resp_txn != transaction_id {
            return Err(IngestError::InvalidFrame {
                device_id: self.device_id.clone(),
                message: format!("transaction id mismatch: sent {transaction_id}, got {resp_txn}"),
            });
        }

        let response = frame::parse_read_response(pdu_slice, &self.device_id, function_code)?;
        Ok(response.registers)
    }

    async fn write_with_timeout(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, stream.write_all(frame))
            .await
            .map_err(|_| IngestError::timeout(&self.device_id, self.timeout.as_millis() as u64))?
            .map_err(|e| IngestError::connection(&self.device_id, e.to_string()))
    }

    async fn read_exact_with_timeout(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, stream.read_exact(buf))
            .await
            .map_err(|_| IngestError::timeout(&self.device_id, self.timeout.as_millis() as u64))?
            .map_err(|e| IngestError::connection(&self.device_id, e.to_string()))?;
        Ok(())
    }

    /// Drops the socket after a retry-exhausted failure, without the
    /// graceful 100ms settle of an operator-requested [`Self::disconnect`].
    async fn fail_connection(&self) {
        self.stream.lock().await.take();
        *self.state.lock().await = ConnState::Disconnected;
    }

    /// Closes the socket and waits for the OS to release the local port.
    pub async fn disconnect(&self) {
        *self.state.lock().await = ConnState::Disconnecting;
        self.stream.lock().await.take();
        tokio::time::sleep(DISCONNECT_SETTLE).await;
        *self.state.lock().await = ConnState::Disconnected;
    }
}
