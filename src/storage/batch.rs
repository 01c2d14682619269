//! Batched storage pipeline (C8): a bounded producer/consumer queue with a
//! drop-oldest backpressure policy, batched by size or time, writing to a
//! `TimeSeriesStore`. Failed batches are handed to the dead-letter queue (C9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::core::error::Result;
use crate::core::reading::DeviceReading;
use crate::storage::dlq::DeadLetterQueue;

/// External time-series store collaborator (§6). An in-memory fake
/// implementing this trait is used by the integration test scenarios.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Writes a batch transactionally: it is applied in full or rejected in full.
    async fn write_batch(&self, batch: &[DeviceReading]) -> Result<()>;
    /// Startup/health connectivity check.
    async fn ping(&self) -> Result<()>;
}

fn default_capacity() -> usize {
    1000
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    5000
}

/// Batching behavior (§6 `timescale.{batch_size, batch_timeout_ms}` and the
/// queue capacity named in §4.8).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

/// A bounded ring buffer that drops the oldest entry instead of blocking or
/// rejecting the newest one when full. `tokio::sync::mpsc` has no such mode
/// (only the receiver can dequeue), so producers and the single consumer
/// share this buffer directly behind a short-held `std::sync::Mutex`.
struct DropOldestQueue<T> {
    inner: StdMutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, item: T) {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.len() >= self.capacity {
                guard.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("batch queue full, dropped oldest reading");
            }
            guard.push_back(item);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Waits for and returns the next item. Cancel-safe: cancelling before
    /// the notification resolves leaves the queue untouched.
    async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded producer/consumer batching pipeline (C8).
pub struct BatchWriter {
    queue: Arc<DropOldestQueue<DeviceReading>>,
    stop_tx: watch::Sender<bool>,
    force_flush_tx: tokio::sync::mpsc::Sender<oneshot::Sender<()>>,
    consumer: StdMutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    pub fn start<S: TimeSeriesStore + 'static>(store: Arc<S>, dlq: Arc<DeadLetterQueue>, config: BatchConfig) -> Self {
        let queue = Arc::new(DropOldestQueue::new(config.capacity));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (force_flush_tx, force_flush_rx) = tokio::sync::mpsc::channel(8);

        let consumer = tokio::spawn(consumer_loop(
            queue.clone(),
            store,
            dlq,
            config.batch_size.max(1),
            Duration::from_millis(config.batch_timeout_ms.max(1)),
            stop_rx,
            force_flush_rx,
        ));

        Self {
            queue,
            stop_tx,
            force_flush_tx,
            consumer: StdMutex::new(Some(consumer)),
        }
    }

    /// Enqueues a reading without ever awaiting a consumer. Under backpressure
    /// the oldest queued reading is silently dropped (and counted).
    pub fn enqueue(&self, reading: DeviceReading) {
        self.queue.push(reading);
    }

    pub fn messages_dropped(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Requests an immediate flush of whatever is queued plus any pending
    /// partial batch, and waits for it to complete (bounded by `timeout`).
    pub async fn force_flush(&self, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.force_flush_tx.send(ack_tx).await.is_err() {
            return Ok(()); // consumer already gone
        }
        let _ = tokio::time::timeout(timeout, ack_rx).await;
        Ok(())
    }

    /// Signals the consumer to stop, force-flushes the tail, and waits
    /// (bounded) for the consumer task to exit.
    pub async fn stop(&self, drain_timeout: Duration) {
        self.force_flush(drain_timeout).await.ok();
        let _ = self.stop_tx.send(true);
        let handle = self.consumer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(drain_timeout, handle).await;
        }
    }
}

async fn flush<S: TimeSeriesStore>(store: &S, dlq: &DeadLetterQueue, pending: &mut Vec<DeviceReading>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    match store.write_batch(&batch).await {
        Ok(()) => {}
        Err(e) => {
            warn!(error = %e, batch_len = batch.len(), "batch write failed, routing to dead-letter queue");
            if let Err(dlq_err) = dlq.enqueue(batch, e.to_string()).await {
                // The DLQ itself rejected the write (e.g. disk full): this is
                // the "reported as lost" path named in §4.8's shutdown note.
                tracing::error!(critical = true, error = %dlq_err, "failed to persist rejected batch to the dead-letter queue, readings lost");
            }
        }
    }
}

async fn consumer_loop<S: TimeSeriesStore>(
    queue: Arc<DropOldestQueue<DeviceReading>>,
    store: Arc<S>,
    dlq: Arc<DeadLetterQueue>,
    batch_size: usize,
    batch_timeout: Duration,
    mut stop_rx: watch::Receiver<bool>,
    mut force_flush_rx: tokio::sync::mpsc::Receiver<oneshot::Sender<()>>,
) {
    let mut pending = Vec::with_capacity(batch_size);
    let mut deadline: Option<Instant> = None;
    const IDLE_POLL: Duration = Duration::from_secs(3600);

    loop {
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + IDLE_POLL);

        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            ack = force_flush_rx.recv() => {
                while let Some(item) = queue.try_pop() {
                    pending.push(item);
                }
                flush(store.as_ref(), dlq.as_ref(), &mut pending).await;
                deadline = None;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            item = queue.pop() => {
                if pending.is_empty() {
                    deadline = Some(Instant::now() + batch_timeout);
                }
                pending.push(item);
                if pending.len() >= batch_size {
                    flush(store.as_ref(), dlq.as_ref(), &mut pending).await;
                    deadline = None;
                }
            }
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                flush(store.as_ref(), dlq.as_ref(), &mut pending).await;
                deadline = None;
            }
        }
    }

    // Final drain: pick up whatever is still queued before exiting.
    while let Some(item) = queue.try_pop() {
        pending.push(item);
    }
    flush(store.as_ref(), dlq.as_ref(), &mut pending).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quality::Quality;
    use crate::storage::dlq::DlqConfig;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    fn reading(device_id: &str) -> DeviceReading {
        DeviceReading {
            device_id: device_id.to_string(),
            channel: 1,
            timestamp: chrono::Utc::now(),
            raw_value: 1,
            processed_value: 1.0,
            rate: None,
            quality: Quality::Good,
            unit: String::new(),
            tags: Default::default(),
        }
    }

    struct RecordingStore {
        batches: AsyncMutex<Vec<Vec<DeviceReading>>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                batches: AsyncMutex::new(Vec::new()),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TimeSeriesStore for RecordingStore {
        async fn write_batch(&self, batch: &[DeviceReading]) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(crate::core::error::IngestError::connection("store", "injected failure"));
            }
            self.batches.lock().await.push(batch.to_vec());
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn dlq_in_tmp() -> Arc<DeadLetterQueue> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("daq-ingest-batch-test-{}-{n}", std::process::id()));
        Arc::new(DeadLetterQueue::new(DlqConfig {
            directory: dir,
            max_retry_attempts: 5,
            disk_warning_bytes: 100 * 1024 * 1024,
        })
        .unwrap())
    }

    #[tokio::test]
    async fn flushes_at_exactly_the_configured_batch_size() {
        let store = Arc::new(RecordingStore::new());
        let writer = BatchWriter::start(
            store.clone(),
            dlq_in_tmp(),
            BatchConfig {
                capacity: 1000,
                batch_size: 3,
                batch_timeout_ms: 60_000,
            },
        );

        for _ in 0..3 {
            writer.enqueue(reading("d1"));
        }
        // Give the consumer task a moment to drain and flush.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = store.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        drop(batches);

        writer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn force_flush_drains_a_partial_batch() {
        let store = Arc::new(RecordingStore::new());
        let writer = BatchWriter::start(
            store.clone(),
            dlq_in_tmp(),
            BatchConfig {
                capacity: 1000,
                batch_size: 100,
                batch_timeout_ms: 60_000,
            },
        );

        writer.enqueue(reading("d1"));
        writer.force_flush(Duration::from_secs(1)).await.unwrap();

        let batches = store.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        drop(batches);

        writer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_oldest_and_counts_it() {
        let store = Arc::new(RecordingStore::new());
        let writer = BatchWriter::start(
            store,
            dlq_in_tmp(),
            BatchConfig {
                capacity: 2,
                batch_size: 1000,
                batch_timeout_ms: 60_000,
            },
        );

        // The consumer is slow to be scheduled relative to these synchronous
        // pushes, so the queue fills before it can drain.
        writer.enqueue(reading("d1"));
        writer.enqueue(reading("d2"));
        writer.enqueue(reading("d3"));

        assert!(writer.messages_dropped() >= 1);
        writer.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn a_failed_write_is_routed_to_the_dead_letter_queue() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next.store(true, Ordering::SeqCst);
        let dlq = dlq_in_tmp();
        let writer = BatchWriter::start(
            store,
            dlq.clone(),
            BatchConfig {
                capacity: 1000,
                batch_size: 1,
                batch_timeout_ms: 60_000,
            },
        );

        writer.enqueue(reading("d1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dlq.queue_len().unwrap(), 1);

        writer.stop(Duration::from_secs(1)).await;
    }
}
