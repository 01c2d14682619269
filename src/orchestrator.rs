//! Orchestrator (C10): wires C1-C9 together, owns the pipeline's lifecycle,
//! and reports aggregate status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::core::error::{IngestError, Result};
use crate::core::reading::{DeviceReading, MqttDeviceConfig};
use crate::health::{DeviceHealthSnapshot, HealthTracker};
use crate::modbus::DevicePool;
use crate::mqtt::{InboundMessage, MqttClient, TopicSubscriptions};
use crate::processor::DataProcessor;
use crate::storage::{BatchWriter, DeadLetterQueue, TimeSeriesStore};

/// How long shutdown waits for the batching consumer and polling tasks to
/// settle before giving up (§4.10's "bounded wait (e.g., 5s)").
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
/// Interval between dead-letter queue retry passes (§4.9).
const DLQ_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Capacity of the channel C3/C4 emit readings onto before they reach C8.
const READING_CHANNEL_CAPACITY: usize = 1000;

/// Point-in-time operational snapshot, returned by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct Status {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub modbus_device_count: usize,
    pub mqtt_device_count: usize,
    pub dead_letter_queue_len: usize,
    pub messages_dropped: u64,
    pub device_health: Vec<DeviceHealthSnapshot>,
}

/// Wires together the device pool (C3), MQTT ingest (C4-C6), the data
/// processor (C7), batched storage (C8), and the dead-letter queue (C9).
pub struct Orchestrator<S: TimeSeriesStore + 'static> {
    config: AppConfig,
    health: Arc<HealthTracker>,
    processor: Arc<DataProcessor>,
    device_pool: Arc<DevicePool>,
    topic_subscriptions: Arc<TopicSubscriptions>,
    dlq: Arc<DeadLetterQueue>,
    batch_writer: Arc<BatchWriter>,
    started_at: Option<DateTime<Utc>>,
    mqtt_client: Option<MqttClient>,
    mqtt_ingest_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
    dlq_retry_task: Option<JoinHandle<()>>,
    health_check_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    store: Arc<S>,
}

impl<S: TimeSeriesStore + 'static> Orchestrator<S> {
    /// Validates `config`, checks store connectivity, and constructs every
    /// collaborator, but does not start polling or ingest yet — call
    /// [`Self::start`] for that.
    pub async fn new(config: AppConfig, store: Arc<S>) -> Result<Self> {
        config.validate().map_err(IngestError::from)?;
        store.ping().await.map_err(|e| IngestError::connection("timescale", format!("startup connectivity check failed: {e}")))?;

        let health = Arc::new(HealthTracker::new());
        let processor = Arc::new(DataProcessor::new());
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_config())?);
        let batch_writer = Arc::new(BatchWriter::start(store.clone(), dlq.clone(), config.batch_config()));

        let (tx, rx) = mpsc::channel::<DeviceReading>(READING_CHANNEL_CAPACITY);
        let device_pool = Arc::new(DevicePool::new(health.clone(), processor.clone(), tx.clone()));
        let topic_subscriptions = Arc::new(TopicSubscriptions::new());

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let forward_writer = batch_writer.clone();
        let static_tags = config.timescale.tags.clone();
        let forward_task = tokio::spawn(forward_readings(rx, forward_writer, static_tags));

        Ok(Self {
            config,
            health,
            processor,
            device_pool,
            topic_subscriptions,
            dlq,
            batch_writer,
            started_at: None,
            mqtt_client: None,
            mqtt_ingest_task: None,
            forward_task: Some(forward_task),
            dlq_retry_task: None,
            health_check_task: None,
            shutdown_tx,
            store,
        })
    }

    /// Registers configured devices, starts MQTT ingest (if configured), and
    /// starts the DLQ retry timer.
    pub async fn start(&mut self) -> Result<()> {
        for device in self.config.devices.iter().filter(|d| d.enabled) {
            let mut device = device.clone();
            if device.poll_interval_ms.is_none() {
                device.poll_interval_ms = Some(self.config.global_poll_interval_ms);
            }
            self.device_pool.add(device)?;
        }

        if let Some(mqtt_settings) = &self.config.mqtt {
            self.topic_subscriptions.register(&self.config.mqtt_devices);
            let mqtt_config = self
                .config
                .mqtt_client_config()
                .expect("mqtt section present implies mqtt_client_config() is Some");
            let (client, rx) = MqttClient::start(mqtt_config);
            let subscriptions = self.topic_subscriptions.build_subscriptions(&self.config.mqtt_devices, mqtt_settings.qos);
            if let Err(e) = client.subscribe(&subscriptions).await {
                error!(error = %e, "initial mqtt subscription failed");
            }

            let devices_by_id: HashMap<String, MqttDeviceConfig> =
                self.config.mqtt_devices.iter().filter(|d| d.enabled).map(|d| (d.device_id.clone(), d.clone())).collect();

            let ingest_task = tokio::spawn(mqtt_ingest_loop(
                rx,
                self.topic_subscriptions.clone(),
                devices_by_id,
                self.processor.clone(),
                self.batch_writer.clone(),
                mqtt_settings.max_json_payload_bytes,
                self.config.timescale.tags.clone(),
            ));

            self.mqtt_client = Some(client);
            self.mqtt_ingest_task = Some(ingest_task);
        } else if !self.config.mqtt_devices.is_empty() {
            warn!("mqtt_devices configured without an [mqtt] broker section; they will never receive data");
        }

        let dlq = self.dlq.clone();
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.dlq_retry_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DLQ_RETRY_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        retry_dlq_once(&dlq, store.as_ref()).await;
                    }
                }
            }
        }));

        let health = self.health.clone();
        let health_check_interval = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.health_check_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_check_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        log_health_summary(&health);
                    }
                }
            }
        }));

        self.started_at = Some(Utc::now());
        info!(
            modbus_devices = self.device_pool.device_count(),
            mqtt_devices = self.config.mqtt_devices.len(),
            "ingest pipeline started"
        );
        Ok(())
    }

    /// Ordered shutdown per §4.10: cancel polling, disconnect MQTT, drain
    /// the batching pipeline, force-flush, then stop the DLQ retry timer.
    pub async fn stop(&mut self) {
        info!("ingest pipeline stopping");
        let _ = self.shutdown_tx.send(true);

        self.device_pool.stop_all().await;

        if let Some(client) = self.mqtt_client.take() {
            client.stop().await;
        }
        if let Some(task) = self.mqtt_ingest_task.take() {
            task.abort();
        }

        self.batch_writer.stop(SHUTDOWN_DRAIN).await;

        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        if let Some(task) = self.dlq_retry_task.take() {
            let _ = tokio::time::timeout(SHUTDOWN_DRAIN, task).await;
        }
        if let Some(task) = self.health_check_task.take() {
            task.abort();
        }

        info!("ingest pipeline stopped");
    }

    /// Running state, start time, device counts, and a health snapshot (§4.10).
    pub fn status(&self) -> Status {
        Status {
            running: self.started_at.is_some(),
            started_at: self.started_at,
            modbus_device_count: self.device_pool.device_count(),
            mqtt_device_count: self.config.mqtt_devices.len(),
            dead_letter_queue_len: self.dlq.queue_len().unwrap_or(0),
            messages_dropped: self.batch_writer.messages_dropped(),
            device_health: self.health.get_all(),
        }
    }

    pub fn add_device(&self, config: crate::core::reading::DeviceConfig) -> Result<()> {
        self.device_pool.add(config)
    }

    pub async fn remove_device(&self, device_id: &str) {
        self.device_pool.remove(device_id).await;
    }

    pub async fn restart_device(&self, device_id: &str) -> Result<()> {
        self.device_pool.restart(device_id).await
    }
}

/// Drains readings from the Modbus poll pool and attaches the operator's
/// static `timescale.tags` before handing them to the batching pipeline.
async fn forward_readings(mut rx: mpsc::Receiver<DeviceReading>, batch_writer: Arc<BatchWriter>, static_tags: HashMap<String, String>) {
    while let Some(mut reading) = rx.recv().await {
        for (key, value) in &static_tags {
            reading = reading.with_tag(key.clone(), value.clone());
        }
        batch_writer.enqueue(reading);
    }
}

/// Routes one inbound MQTT message through C5 (topic match) and C6 (decode)
/// into C7 (the data processor), then forwards the result to the batching
/// pipeline. Decode/routing failures are logged and the message is
/// dropped - per §4.4 a handler exception must never kill the ingest task.
async fn mqtt_ingest_loop(
    mut rx: mpsc::Receiver<InboundMessage>,
    topic_subscriptions: Arc<TopicSubscriptions>,
    devices_by_id: HashMap<String, MqttDeviceConfig>,
    processor: Arc<DataProcessor>,
    sink: Arc<BatchWriter>,
    max_json_payload_bytes: usize,
    static_tags: HashMap<String, String>,
) {
    while let Some(message) = rx.recv().await {
        let Some(device_id) = topic_subscriptions.find_device_for(&message.topic) else {
            warn!(topic = %message.topic, "mqtt message on an unmatched topic, dropping");
            continue;
        };
        let Some(device) = devices_by_id.get(&device_id) else {
            warn!(device_id, "mqtt message matched a device with no decode config, dropping");
            continue;
        };

        let received_at = Utc::now();
        let sample = match crate::mqtt::decoder::decode(device, &message.payload, received_at, max_json_payload_bytes) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(device_id, topic = %message.topic, error = %e, "mqtt payload decode failed, dropping message");
                continue;
            }
        };

        processor.register_mqtt_device(&sample.device_id, sample.channel, device.scale, &device.unit, device.data_type);
        let mut reading = processor.process_success(&sample.device_id, sample.channel, sample.timestamp, sample.raw_value);
        for (key, value) in &static_tags {
            reading = reading.with_tag(key.clone(), value.clone());
        }
        sink.enqueue(reading);
    }
}

/// Periodic health summary (§6 `health_check_interval_ms`), logged rather
/// than returned - `status()` remains the on-demand, structured view of the
/// same data for the orchestrator's callers.
fn log_health_summary(health: &HealthTracker) {
    let snapshots = health.get_all();
    let offline = snapshots.iter().filter(|s| s.is_offline()).count();
    if offline > 0 {
        warn!(devices = snapshots.len(), offline, "periodic health check: one or more devices offline");
    } else {
        info!(devices = snapshots.len(), "periodic health check: all devices reporting");
    }
}

async fn retry_dlq_once<S: TimeSeriesStore>(dlq: &DeadLetterQueue, store: &S) {
    match dlq.retry(store).await {
        Ok(outcome) if outcome.replayed > 0 || outcome.remaining > 0 => {
            info!(replayed = outcome.replayed, remaining = outcome.remaining, "dead-letter queue retry pass complete");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "dead-letter queue retry pass failed"),
    }
}
