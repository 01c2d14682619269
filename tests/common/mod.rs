//! Shared fixtures for the end-to-end scenario tests (S1-S6, §8): an
//! in-memory `TimeSeriesStore` fake and a minimal hand-rolled Modbus/TCP
//! responder, plus the small config helpers every scenario needs.
//!
//! This module is not itself a test binary (Cargo only promotes top-level
//! `tests/*.rs` files); each scenario file pulls it in with `mod common;`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use daq_ingest::config::AppConfig;
use daq_ingest::core::error::{IngestError, Result};
use daq_ingest::core::reading::{ChannelConfig, DataType, DeviceConfig, DeviceReading, RegisterType};
use daq_ingest::storage::TimeSeriesStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Records every batch handed to it; can be told to reject writes on demand
/// so the dead-letter-queue scenarios can simulate a store outage.
#[derive(Default)]
pub struct InMemoryStore {
    batches: Mutex<Vec<Vec<DeviceReading>>>,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn all_readings(&self) -> Vec<DeviceReading> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryStore {
    async fn write_batch(&self, batch: &[DeviceReading]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngestError::connection("store", "injected outage"));
        }
        self.batches.lock().await.push(batch.to_vec());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Binds an ephemeral port and immediately releases it, for handing to a
/// fixture that wants a fixed port number to (re)bind later.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A unique scratch directory under the OS temp dir for a dead-letter queue.
pub fn tmp_dir(label: &str) -> std::path::PathBuf {
    static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("daq-ingest-itest-{label}-{}-{n}", std::process::id()))
}

/// Spawns a minimal Modbus/TCP responder serving a single `UInt32Counter`
/// holding-register channel that increments by `step` on every poll.
///
/// Connections are served strictly one at a time inside the same task (no
/// per-connection subtask), so aborting the returned handle tears down both
/// the listener and whatever connection is currently open - standing in for
/// a simulator being stopped mid-session (S4).
pub fn spawn_counter_responder(port: u16, step: u32) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(l) => l,
            Err(_) => return,
        };
        let mut value: u32 = 0;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            loop {
                let mut header = [0u8; 7];
                if socket.read_exact(&mut header).await.is_err() {
                    break;
                }
                let mut pdu = [0u8; 5];
                if socket.read_exact(&mut pdu).await.is_err() {
                    break;
                }

                value = value.wrapping_add(step);
                let regs = daq_ingest::modbus::codec::encode_uint32_low_first(value);
                let resp_pdu = [
                    0x03,
                    0x04,
                    (regs[0] >> 8) as u8,
                    (regs[0] & 0xFF) as u8,
                    (regs[1] >> 8) as u8,
                    (regs[1] & 0xFF) as u8,
                ];
                let transaction_id = ((header[0] as u16) << 8) | header[1] as u16;
                let unit_id = header[6];
                let mbap = daq_ingest::modbus::frame::build_mbap(transaction_id, unit_id, resp_pdu.len());

                if socket.write_all(&mbap).await.is_err() || socket.write_all(&resp_pdu).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// A single-channel `UInt32Counter` device pointed at `127.0.0.1:port`.
pub fn device_config(device_id: &str, port: u16, poll_interval_ms: u64, timeout_ms: u64, max_retries: u32) -> DeviceConfig {
    DeviceConfig {
        device_id: device_id.to_string(),
        ip: "127.0.0.1".parse().unwrap(),
        port,
        unit_id: 1,
        poll_interval_ms: Some(poll_interval_ms),
        timeout_ms,
        max_retries,
        keep_alive: false,
        enabled: true,
        channels: vec![ChannelConfig {
            channel_number: 1,
            start_register: 0,
            register_count: 2,
            register_type: RegisterType::Holding,
            data_type: DataType::UInt32Counter,
            scale: 1.0,
            offset: 0.0,
            unit: "count".to_string(),
            min: None,
            max: None,
            max_change_rate: None,
            rate_window_seconds: 60,
            enabled: true,
        }],
    }
}

/// An `AppConfig` with just enough `[timescale]` to pass validation. The
/// actual store is swapped out for `InMemoryStore`, so the connection
/// fields here are never dialed.
pub fn base_app_config(dlq_dir: std::path::PathBuf) -> AppConfig {
    let mut config = AppConfig::parse(
        r#"
        [timescale]
        host = "localhost"
        database = "scada"
        username = "ingest"
        batch_size = 1
        batch_timeout_ms = 200
        "#,
    )
    .unwrap();
    config.timescale.dlq_directory = dlq_dir;
    config
}
