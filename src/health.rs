//! Device-health tracker (C1).
//!
//! A single concurrently-writable map of per-device success/failure
//! counters. Many polling tasks (one per Modbus device, plus the MQTT
//! ingest path) update entries concurrently; readers (the orchestrator's
//! `status()`) must never see a torn counter, so every numeric field is an
//! atomic updated with `Ordering::Relaxed` (monotonic counts) or
//! `Ordering::SeqCst` (the `is_connected` flag, which additionally gates a
//! one-time log transition and so needs a stronger ordering to avoid a
//! duplicate log race between concurrent failures).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

/// A device is considered offline once this many consecutive reads have failed.
pub const OFFLINE_THRESHOLD: u32 = 5;

/// Number of response-time samples retained per device for the rolling window.
const ROLLING_WINDOW_LEN: usize = 100;

struct HealthEntry {
    is_connected: AtomicBool,
    consecutive_failures: AtomicU32,
    total_reads: AtomicU64,
    successful_reads: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    response_times_ms: Mutex<VecDeque<u64>>,
}

impl HealthEntry {
    fn new() -> Self {
        Self {
            // A freshly-seen device is presumed reachable until proven otherwise.
            is_connected: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            total_reads: AtomicU64::new(0),
            successful_reads: AtomicU64::new(0),
            last_success: Mutex::new(None),
            last_error: Mutex::new(None),
            response_times_ms: Mutex::new(VecDeque::with_capacity(ROLLING_WINDOW_LEN)),
        }
    }
}

/// Point-in-time, immutable view of a device's health, safe to hand to callers.
#[derive(Debug, Clone)]
pub struct DeviceHealthSnapshot {
    pub device_id: String,
    pub is_connected: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub total_reads: u64,
    pub successful_reads: u64,
}

impl DeviceHealthSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            return 100.0;
        }
        100.0 * (self.successful_reads as f64) / (self.total_reads as f64)
    }

    pub fn is_offline(&self) -> bool {
        self.consecutive_failures >= OFFLINE_THRESHOLD
    }
}

/// Concurrent device-health tracker (C1).
#[derive(Default)]
pub struct HealthTracker {
    entries: DashMap<String, HealthEntry>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a successful read, with the wall-clock time the read took.
    pub fn record_success(&self, device_id: &str, response_duration: Duration) {
        let entry = self
            .entries
            .entry(device_id.to_string())
            .or_insert_with(HealthEntry::new);

        let was_offline = entry.consecutive_failures.load(Ordering::SeqCst) >= OFFLINE_THRESHOLD;

        entry.consecutive_failures.store(0, Ordering::SeqCst);
        entry.total_reads.fetch_add(1, Ordering::Relaxed);
        entry.successful_reads.fetch_add(1, Ordering::Relaxed);
        *entry.last_success.lock().unwrap() = Some(Utc::now());

        {
            let mut window = entry.response_times_ms.lock().unwrap();
            if window.len() >= ROLLING_WINDOW_LEN {
                window.pop_front();
            }
            window.push_back(response_duration.as_millis() as u64);
        }

        if was_offline {
            entry.is_connected.store(true, Ordering::SeqCst);
            info!(device_id, "device reconnected, health restored");
        }
    }

    /// Record a failed read with its error message.
    pub fn record_failure(&self, device_id: &str, error_message: impl Into<String>) {
        let entry = self
            .entries
            .entry(device_id.to_string())
            .or_insert_with(HealthEntry::new);

        entry.total_reads.fetch_add(1, Ordering::Relaxed);
        let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *entry.last_error.lock().unwrap() = Some(error_message.into());

        // Log the offline transition exactly once: only the failure that
        // crosses the threshold, not every failure after it.
        if failures == OFFLINE_THRESHOLD {
            entry.is_connected.store(false, Ordering::SeqCst);
            warn!(device_id, consecutive_failures = failures, "device marked offline");
        }
    }

    fn snapshot_of(device_id: &str, entry: &HealthEntry) -> DeviceHealthSnapshot {
        DeviceHealthSnapshot {
            device_id: device_id.to_string(),
            is_connected: entry.is_connected.load(Ordering::SeqCst),
            last_success: *entry.last_success.lock().unwrap(),
            consecutive_failures: entry.consecutive_failures.load(Ordering::SeqCst),
            last_error: entry.last_error.lock().unwrap().clone(),
            total_reads: entry.total_reads.load(Ordering::Relaxed),
            successful_reads: entry.successful_reads.load(Ordering::Relaxed),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceHealthSnapshot> {
        self.entries
            .get(device_id)
            .map(|entry| Self::snapshot_of(device_id, &entry))
    }

    pub fn get_all(&self) -> Vec<DeviceHealthSnapshot> {
        self.entries
            .iter()
            .map(|entry| Self::snapshot_of(entry.key(), entry.value()))
            .collect()
    }

    /// Reset a device's health entry, e.g. on restart.
    pub fn reset(&self, device_id: &str) {
        self.entries.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_offline_exactly_at_threshold_and_once() {
        let tracker = HealthTracker::new();
        for _ in 0..(OFFLINE_THRESHOLD - 1) {
            tracker.record_failure("d1", "timeout");
        }
        assert!(!tracker.get("d1").unwrap().is_offline());

        tracker.record_failure("d1", "timeout");
        let snap = tracker.get("d1").unwrap();
        assert!(snap.is_offline());
        assert!(!snap.is_connected);

        // Further failures keep it offline without re-triggering the transition log.
        tracker.record_failure("d1", "timeout");
        let snap = tracker.get("d1").unwrap();
        assert_eq!(snap.consecutive_failures, OFFLINE_THRESHOLD + 1);
        assert!(!snap.is_connected);
    }

    #[test]
    fn success_resets_consecutive_failures_and_reconnects() {
        let tracker = HealthTracker::new();
        for _ in 0..OFFLINE_THRESHOLD {
            tracker.record_failure("d1", "timeout");
        }
        assert!(tracker.get("d1").unwrap().is_offline());

        tracker.record_success("d1", Duration::from_millis(12));
        let snap = tracker.get("d1").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.is_connected);
    }

    #[test]
    fn success_rate_is_percentage_of_total() {
        let tracker = HealthTracker::new();
        tracker.record_success("d1", Duration::from_millis(1));
        tracker.record_success("d1", Duration::from_millis(1));
        tracker.record_failure("d1", "x");
        let snap = tracker.get("d1").unwrap();
        assert!((snap.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn reset_removes_the_entry() {
        let tracker = HealthTracker::new();
        tracker.record_success("d1", Duration::from_millis(1));
        tracker.reset("d1");
        assert!(tracker.get("d1").is_none());
    }
}
