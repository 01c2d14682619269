//! A `TimeSeriesStore` that logs batches instead of writing them anywhere.
//!
//! The real time-series database is an external collaborator (§1, out of
//! scope): this crate is a client of whatever store is configured, not an
//! implementation of one. `DemoStore` exists so the binary entry point
//! (C14) is runnable end-to-end for its own integration tests without a
//! database dependency, activated by `demo_mode = true`.

use tracing::info;

use crate::core::error::Result;
use crate::core::reading::DeviceReading;
use crate::storage::TimeSeriesStore;

#[derive(Debug, Default)]
pub struct DemoStore;

impl DemoStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for DemoStore {
    async fn write_batch(&self, batch: &[DeviceReading]) -> Result<()> {
        info!(batch_len = batch.len(), "demo store: batch accepted (not persisted)");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quality::Quality;

    #[tokio::test]
    async fn accepts_any_batch_and_never_fails() {
        let store = DemoStore::new();
        let reading = DeviceReading {
            device_id: "d1".to_string(),
            channel: 1,
            timestamp: chrono::Utc::now(),
            raw_value: 1,
            processed_value: 1.0,
            rate: None,
            quality: Quality::Good,
            unit: String::new(),
            tags: Default::default(),
        };
        store.write_batch(&[reading]).await.unwrap();
        store.ping().await.unwrap();
    }
}
