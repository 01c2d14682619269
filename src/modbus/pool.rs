//! Device pool (C3): one polling task per configured Modbus device.
//!
//! Channels on the same device are read sequentially within that device's
//! task, since a Modbus/TCP connection only ever has one outstanding
//! request; devices poll fully in parallel on the shared runtime.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::error::{IngestError, Result};
use crate::core::reading::{DeviceConfig, DeviceReading};
use crate::health::HealthTracker;
use crate::modbus::codec;
use crate::modbus::connection::ModbusConnection;
use crate::processor::DataProcessor;

/// Fallback poll cadence for a device that specifies neither its own
/// `poll_interval_ms` nor a resolved `global_poll_interval_ms` (§6).
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

struct DeviceHandle {
    config: DeviceConfig,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns a set of Modbus devices and their polling tasks (C3).
pub struct DevicePool {
    health: Arc<HealthTracker>,
    processor: Arc<DataProcessor>,
    tx: mpsc::Sender<DeviceReading>,
    devices: DashMap<String, DeviceHandle>,
}

impl DevicePool {
    pub fn new(health: Arc<HealthTracker>, processor: Arc<DataProcessor>, tx: mpsc::Sender<DeviceReading>) -> Self {
        Self {
            health,
            processor,
            tx,
            devices: DashMap::new(),
        }
    }

    /// Registers a device and starts its polling task. Rejects a duplicate
    /// `device_id` rather than silently replacing it.
    pub fn add(&self, config: DeviceConfig) -> Result<()> {
        if self.devices.contains_key(&config.device_id) {
            return Err(IngestError::config(format!("device '{}' is already registered", config.device_id)));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let addr = SocketAddr::V4(SocketAddrV4::new(config.ip, config.port));
        let device_id = config.device_id.clone();

        let join = tokio::spawn(run_device(
            device_id.clone(),
            addr,
            config.unit_id,
            config.timeout_ms,
            config.max_retries,
            config.keep_alive,
            config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            config.channels.clone(),
            self.health.clone(),
            self.processor.clone(),
            self.tx.clone(),
            stop_rx,
        ));

        info!(device_id, addr = %addr, "device polling task started");
        self.devices.insert(
            device_id,
            DeviceHandle {
                config,
                stop_tx,
                join,
            },
        );
        Ok(())
    }

    /// Cancels the device's polling task and clears its health/rate state.
    /// A no-op, not an error, if the device is not registered.
    pub async fn remove(&self, device_id: &str) {
        let Some((_, handle)) = self.devices.remove(device_id) else {
            return;
        };
        let _ = handle.stop_tx.send(true);
        let _ = handle.join.await;
        self.health.reset(device_id);
        self.processor.reset_device(device_id);
        info!(device_id, "device polling task stopped");
    }

    /// Stops and restarts a device, preserving its configuration and
    /// resetting its health counters.
    pub async fn restart(&self, device_id: &str) -> Result<()> {
        let config = self.devices.get(device_id).map(|h| h.config.clone());
        let Some(config) = config else {
            return Err(IngestError::config(format!("device '{device_id}' is not registered")));
        };
        self.remove(device_id).await;
        self.add(config)
    }

    /// Stops every registered device's polling task.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|e| e.key().clone()).collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_device(
    device_id: String,
    addr: SocketAddr,
    unit_id: u8,
    timeout_ms: u64,
    max_retries: u32,
    keep_alive: bool,
    poll_interval_ms: u64,
    channels: Vec<crate::core::reading::ChannelConfig>,
    health: Arc<HealthTracker>,
    processor: Arc<DataProcessor>,
    tx: mpsc::Sender<DeviceReading>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let connection = ModbusConnection::new(device_id.clone(), addr, unit_id, Duration::from_millis(timeout_ms), max_retries, keep_alive);
    processor.register_modbus_device(&device_id, &channels);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if !connection.is_connected().await {
            if let Err(e) = connection.connect().await {
                debug!(device_id, error = %e, "device not connected for this poll pass");
            }
        }

        for channel in channels.iter().filter(|c| c.enabled) {
            if *stop_rx.borrow() {
                break;
            }

            let timestamp = Utc::now();
            let started = Instant::now();
            let reading = match connection.read_registers(channel.start_register, channel.register_count, channel.register_type).await {
                Ok(registers) => match codec::decode_registers(&registers, channel.data_type, &device_id) {
                    Ok(raw) => {
                        health.record_success(&device_id, started.elapsed());
                        processor.process_success(&device_id, channel.channel_number, timestamp, raw)
                    }
                    Err(e) => {
                        health.record_failure(&device_id, e.to_string());
                        processor.process_failure(&device_id, channel.channel_number, timestamp, e.to_string())
                    }
                },
                Err(e) => {
                    health.record_failure(&device_id, e.to_string());
                    processor.process_failure(&device_id, channel.channel_number, timestamp, e.to_string())
                }
            };

            if tx.send(reading).await.is_err() {
                // Downstream storage pipeline is gone; nothing left to do.
                connection.disconnect().await;
                return;
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(poll_interval_ms)) => {}
        }
    }

    connection.disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::{ChannelConfig, DataType, RegisterType};
    use tokio::net::TcpListener;

    fn device_config(device_id: &str, port: u16) -> DeviceConfig {
        DeviceConfig {
            device_id: device_id.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            port,
            unit_id: 1,
            poll_interval_ms: Some(50),
            timeout_ms: 200,
            max_retries: 0,
            keep_alive: false,
            enabled: true,
            channels: vec![ChannelConfig {
                channel_number: 1,
                start_register: 0,
                register_count: 1,
                register_type: RegisterType::Holding,
                data_type: DataType::UInt16,
                scale: 1.0,
                offset: 0.0,
                unit: String::new(),
                min: None,
                max: None,
                max_change_rate: None,
                rate_window_seconds: 60,
                enabled: true,
            }],
        }
    }

    #[tokio::test]
    async fn adding_the_same_device_twice_is_rejected() {
        let health = Arc::new(HealthTracker::new());
        let processor = Arc::new(DataProcessor::new());
        let (tx, _rx) = mpsc::channel(16);
        let pool = DevicePool::new(health, processor, tx);

        pool.add(device_config("d1", 5599)).unwrap();
        let err = pool.add(device_config("d1", 5599)).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn unreachable_device_emits_unavailable_readings_without_panicking() {
        let health = Arc::new(HealthTracker::new());
        let processor = Arc::new(DataProcessor::new());
        let (tx, mut rx) = mpsc::channel(16);
        let pool = DevicePool::new(health, processor, tx);

        pool.add(device_config("offline", 5599)).unwrap();
        let reading = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reading.quality, crate::core::quality::Quality::Unavailable);

        pool.stop_all().await;
    }

    #[tokio::test]
    async fn removing_an_unregistered_device_is_a_harmless_no_op() {
        let health = Arc::new(HealthTracker::new());
        let processor = Arc::new(DataProcessor::new());
        let (tx, _rx) = mpsc::channel(16);
        let pool = DevicePool::new(health, processor, tx);
        pool.remove("nonexistent").await;
    }

    #[tokio::test]
    async fn healthy_responder_yields_good_readings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                loop {
                    let mut header = [0u8; 7];
                    if socket.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let mut pdu = [0u8; 5];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        break;
                    }
                    let resp_pdu = [0x03u8, 0x02, 0x00, 0x07];
                    let mbap = crate::modbus::frame::build_mbap(((header[0] as u16) << 8) | header[1] as u16, header[6], resp_pdu.len());
                    if socket.write_all(&mbap).await.is_err() || socket.write_all(&resp_pdu).await.is_err() {
                        break;
                    }
                }
            }
        });

        let health = Arc::new(HealthTracker::new());
        let processor = Arc::new(DataProcessor::new());
        let (tx, mut rx) = mpsc::channel(16);
        let pool = DevicePool::new(health, processor, tx);
        pool.add(device_config("d1", port)).unwrap();

        let reading = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reading.quality, crate::core::quality::Quality::Good);
        assert_eq!(reading.raw_value, 7);

        pool.stop_all().await;
    }
}
