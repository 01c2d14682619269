//! Dead-letter queue (C9): a crash-safe, disk-backed queue of batches the
//! store rejected, with periodic compaction-based retry.
//!
//! On-disk format: one `dlq.jsonl` file per configured queue, append-only,
//! one JSON object per line. A batch is retried by rewriting the survivors
//! to a temp file and atomically renaming it over the original - the
//! standard write-to-temp-then-rename idiom for crash-safe file rewrites.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::core::error::{IngestError, Result};
use crate::core::reading::DeviceReading;
use crate::storage::batch::TimeSeriesStore;

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_disk_warning_bytes() -> u64 {
    100 * 1024 * 1024
}

/// Dead-letter queue settings (§6 `timescale`/DLQ-adjacent options).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    pub directory: PathBuf,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_disk_warning_bytes")]
    pub disk_warning_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DlqRecord {
    enqueued_at: DateTime<Utc>,
    attempt_count: u32,
    last_error: String,
    batch: Vec<DeviceReading>,
}

/// Outcome of one retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub replayed: u32,
    pub remaining: usize,
}

/// Disk-backed dead-letter queue (C9).
pub struct DeadLetterQueue {
    directory: PathBuf,
    max_retry_attempts: u32,
    disk_warning_bytes: u64,
    file_lock: Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory,
            max_retry_attempts: config.max_retry_attempts,
            disk_warning_bytes: config.disk_warning_bytes,
            file_lock: Mutex::new(()),
        })
    }

    fn file_path(&self) -> PathBuf {
        self.directory.join("dlq.jsonl")
    }

    fn tmp_path(&self) -> PathBuf {
        self.directory.join("dlq.jsonl.tmp")
    }

    /// Appends a rejected batch to disk. The write is synced before
    /// returning so a crash immediately after cannot lose the record.
    pub async fn enqueue(&self, batch: Vec<DeviceReading>, error: impl Into<String>) -> Result<()> {
        let record = DlqRecord {
            enqueued_at: Utc::now(),
            attempt_count: 0,
            last_error: error.into(),
            batch,
        };
        let line = serde_json::to_string(&record).map_err(|e| IngestError::internal(format!("failed to serialize dlq record: {e}")))?;

        let _guard = self.file_lock.lock().await;

        if let Ok(metadata) = std::fs::metadata(self.file_path()) {
            if metadata.len() >= self.disk_warning_bytes {
                warn!(bytes = metadata.len(), threshold = self.disk_warning_bytes, "dead-letter queue disk usage crossed warning threshold");
            }
        }

        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(self.file_path()).map_err(IngestError::Io)?;
        writeln!(file, "{line}").map_err(|e| map_write_error(e))?;
        file.sync_all().map_err(IngestError::Io)?;
        Ok(())
    }

    /// Number of batches currently queued on disk.
    pub fn queue_len(&self) -> Result<usize> {
        match std::fs::read_to_string(self.file_path()) {
            Ok(content) => Ok(content.lines().filter(|l| !l.trim().is_empty()).count()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(IngestError::Io(e)),
        }
    }

    /// Replays every queued batch against `store`, in file order. Batches
    /// that succeed are dropped; batches that fail are retained with an
    /// incremented attempt count (logged at CRITICAL once they exceed
    /// `max_retry_attempts`, but never silently discarded).
    pub async fn retry<S: TimeSeriesStore>(&self, store: &S) -> Result<RetryOutcome> {
        let _guard = self.file_lock.lock().await;

        let content = match std::fs::read_to_string(self.file_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RetryOutcome::default()),
            Err(e) => return Err(IngestError::Io(e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let mut survivors = Vec::new();
        let mut replayed = 0u32;

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DlqRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    // Tolerate a truncated trailing line (crash mid-write);
                    // any other corrupt line is still discarded, but logged.
                    let is_trailing = i == lines.len() - 1;
                    warn!(error = %e, trailing = is_trailing, "discarding unparseable dead-letter record");
                    continue;
                }
            };

            match store.write_batch(&record.batch).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    let attempt_count = record.attempt_count + 1;
                    if attempt_count >= self.max_retry_attempts {
                        error!(critical = true, attempts = attempt_count, error = %e, "dead-letter batch exceeded max retry attempts, retaining on disk");
                    }
                    survivors.push(DlqRecord {
                        enqueued_at: record.enqueued_at,
                        attempt_count,
                        last_error: e.to_string(),
                        batch: record.batch,
                    });
                }
            }
        }

        let remaining = survivors.len();
        self.compact(&survivors)?;
        Ok(RetryOutcome { replayed, remaining })
    }

    fn compact(&self, survivors: &[DlqRecord]) -> Result<()> {
        let tmp_path = self.tmp_path();
        {
            let mut tmp = std::fs::File::create(&tmp_path).map_err(IngestError::Io)?;
            for record in survivors {
                let line = serde_json::to_string(record).map_err(|e| IngestError::internal(format!("failed to serialize dlq record: {e}")))?;
                writeln!(tmp, "{line}").map_err(|e| map_write_error(e))?;
            }
            tmp.sync_all().map_err(IngestError::Io)?;
        }
        std::fs::rename(&tmp_path, self.file_path()).map_err(IngestError::Io)?;
        Ok(())
    }
}

fn map_write_error(e: std::io::Error) -> IngestError {
    if e.kind() == std::io::ErrorKind::StorageFull || e.kind() == std::io::ErrorKind::WriteZero {
        IngestError::DiskFull(e.to_string())
    } else {
        IngestError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quality::Quality;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn reading(device_id: &str) -> DeviceReading {
        DeviceReading {
            device_id: device_id.to_string(),
            channel: 1,
            timestamp: Utc::now(),
            raw_value: 42,
            processed_value: 42.0,
            rate: None,
            quality: Quality::Good,
            unit: String::new(),
            tags: Default::default(),
        }
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl TimeSeriesStore for AlwaysFails {
        async fn write_batch(&self, _batch: &[DeviceReading]) -> Result<()> {
            Err(IngestError::connection("store", "down"))
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingStore(Arc<AtomicUsize>);
    #[async_trait::async_trait]
    impl TimeSeriesStore for CountingStore {
        async fn write_batch(&self, batch: &[DeviceReading]) -> Result<()> {
            self.0.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn dlq_in(dir: &std::path::Path) -> DeadLetterQueue {
        DeadLetterQueue::new(DlqConfig {
            directory: dir.to_path_buf(),
            max_retry_attempts: 5,
            disk_warning_bytes: 100 * 1024 * 1024,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_retry_against_a_healthy_store_drains_the_queue() {
        let dir = tempdir();
        let dlq = dlq_in(dir.path());
        dlq.enqueue(vec![reading("d1"), reading("d1")], "db down").await.unwrap();
        assert_eq!(dlq.queue_len().unwrap(), 1);

        let written = Arc::new(AtomicUsize::new(0));
        let outcome = dlq.retry(&CountingStore(written.clone())).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(written.load(Ordering::SeqCst), 2);
        assert_eq!(dlq.queue_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_against_a_failing_store_increments_attempt_count_and_keeps_the_batch() {
        let dir = tempdir();
        let dlq = dlq_in(dir.path());
        dlq.enqueue(vec![reading("d1")], "db down").await.unwrap();

        dlq.retry(&AlwaysFails).await.unwrap();
        assert_eq!(dlq.queue_len().unwrap(), 1);

        let content = std::fs::read_to_string(dir.path().join("dlq.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(record["attempt_count"], 1);
    }

    #[tokio::test]
    async fn a_truncated_trailing_line_is_discarded_not_fatal() {
        let dir = tempdir();
        let dlq = dlq_in(dir.path());
        dlq.enqueue(vec![reading("d1")], "db down").await.unwrap();

        let path = dir.path().join("dlq.jsonl");
        let mut existing = std::fs::read_to_string(&path).unwrap();
        existing.push_str("{\"enqueued_at\":\"2024-01-01T00:00");
        std::fs::write(&path, existing).unwrap();

        let written = Arc::new(AtomicUsize::new(0));
        let outcome = dlq.retry(&CountingStore(written.clone())).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.remaining, 0);
    }

    /// Minimal std-only tempdir so tests don't need a `tempfile` dev-dependency
    /// for a single use site.
    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("daq-ingest-dlq-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        TempDir(dir)
    }
}
