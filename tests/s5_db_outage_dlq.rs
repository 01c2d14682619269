//! S5 (§8): while the store is down, rejected batches land on the
//! dead-letter queue in order; once the store recovers, a retry pass
//! drains the queue and replays every reading.

mod common;

use std::sync::Arc;
use std::time::Duration;

use daq_ingest::core::quality::Quality;
use daq_ingest::core::reading::DeviceReading;
use daq_ingest::storage::{BatchConfig, BatchWriter, DeadLetterQueue, DlqConfig};

fn reading(device_id: &str, channel: u8) -> DeviceReading {
    DeviceReading {
        device_id: device_id.to_string(),
        channel,
        timestamp: chrono::Utc::now(),
        raw_value: channel as i64,
        processed_value: channel as f64,
        rate: None,
        quality: Quality::Good,
        unit: String::new(),
        tags: Default::default(),
    }
}

#[tokio::test]
async fn db_outage_routes_batches_to_the_dead_letter_queue_and_recovers() {
    let store = common::InMemoryStore::new();
    store.set_failing(true);

    let dlq = Arc::new(
        DeadLetterQueue::new(DlqConfig {
            directory: common::tmp_dir("s5"),
            max_retry_attempts: 5,
            disk_warning_bytes: 100 * 1024 * 1024,
        })
        .unwrap(),
    );

    let writer = BatchWriter::start(
        store.clone(),
        dlq.clone(),
        BatchConfig {
            capacity: 1000,
            batch_size: 2,
            batch_timeout_ms: 60_000,
        },
    );

    writer.enqueue(reading("injected-1", 1));
    writer.enqueue(reading("injected-1", 2));
    // Two readings hit the configured batch_size of 2, triggering an
    // immediate flush attempt that the failing store will reject.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(dlq.queue_len().unwrap(), 1, "the rejected batch should now be on disk");
    assert!(store.all_readings().await.is_empty(), "nothing should have reached the store while it's down");

    store.set_failing(false);
    let outcome = dlq.retry(store.as_ref()).await.unwrap();
    assert_eq!(outcome.replayed, 1);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(dlq.queue_len().unwrap(), 0);

    let replayed = store.all_readings().await;
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].device_id, "injected-1");
    assert_eq!(replayed[0].channel, 1);
    assert_eq!(replayed[1].channel, 2);

    writer.stop(Duration::from_secs(1)).await;
}
