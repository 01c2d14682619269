//! Batched time-series storage (C8) and the disk-backed dead-letter queue (C9).

pub mod batch;
pub mod demo;
pub mod dlq;

pub use batch::{BatchConfig, BatchWriter, TimeSeriesStore};
pub use demo::DemoStore;
pub use dlq::{DeadLetterQueue, DlqConfig, RetryOutcome};
