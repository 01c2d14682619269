//! Topic subscription manager (C5): maps inbound MQTT topics to the device
//! configuration that should decode them, honoring `+`/`#` wildcards.
//!
//! The index is held behind a `RwLock<Arc<TopicIndex>>`: a reconfiguration
//! builds a brand-new `TopicIndex` and swaps the `Arc` under a brief write
//! lock, so concurrent readers (one per inbound message) never block on a
//! writer or on each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::core::reading::MqttDeviceConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Plus,
    Hash,
}

fn compile(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .map(|s| match s {
            "+" => Segment::Plus,
            "#" => Segment::Hash,
            other => Segment::Literal(other.to_string()),
        })
        .collect()
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.split('/').any(|s| s == "+" || s == "#")
}

fn matches(segments: &[Segment], topic_levels: &[&str]) -> bool {
    let mut si = 0;
    let mut ti = 0;
    while si < segments.len() {
        match &segments[si] {
            Segment::Hash => return true, // matches zero or more trailing levels
            Segment::Plus => {
                if ti >= topic_levels.len() {
                    return false;
                }
                si += 1;
                ti += 1;
            }
            Segment::Literal(lit) => {
                if ti >= topic_levels.len() || topic_levels[ti] != lit {
                    return false;
                }
                si += 1;
                ti += 1;
            }
        }
    }
    ti == topic_levels.len()
}

struct TopicIndex {
    exact: HashMap<String, String>,
    patterns: Vec<(Vec<Segment>, String)>,
}

impl TopicIndex {
    fn build(devices: &[MqttDeviceConfig]) -> Self {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        let mut seen_patterns = std::collections::HashSet::new();

        for device in devices.iter().filter(|d| d.enabled) {
            for topic in &device.topics {
                if topic.is_empty() {
                    warn!(device_id = %device.device_id, "skipping empty topic pattern");
                    continue;
                }
                if !seen_patterns.insert(topic.clone()) {
                    warn!(device_id = %device.device_id, topic, "skipping duplicate topic pattern");
                    continue;
                }
                if is_wildcard(topic) {
                    // `#` is only valid as the final segment.
                    let segs = compile(topic);
                    if segs.iter().enumerate().any(|(i, s)| matches!(s, Segment::Hash) && i != segs.len() - 1) {
                        warn!(device_id = %device.device_id, topic, "skipping pattern with non-trailing '#'");
                        continue;
                    }
                    patterns.push((segs, device.device_id.clone()));
                } else {
                    exact.insert(topic.clone(), device.device_id.clone());
                }
            }
        }

        Self { exact, patterns }
    }
}

/// Thread-safe, copy-on-write topic -> device index (C5).
#[derive(Default)]
pub struct TopicSubscriptions {
    index: RwLock<Arc<TopicIndex>>,
}

impl TopicSubscriptions {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Arc::new(TopicIndex {
                exact: HashMap::new(),
                patterns: Vec::new(),
            })),
        }
    }

    /// Rebuilds the index from the current set of enabled devices.
    pub fn register(&self, devices: &[MqttDeviceConfig]) {
        let built = Arc::new(TopicIndex::build(devices));
        *self.index.write().unwrap() = built;
    }

    /// Finds the device that should own an inbound message on `topic`.
    /// Exact matches are always preferred over wildcard matches.
    pub fn find_device_for(&self, topic: &str) -> Option<String> {
        let index = self.index.read().unwrap().clone();
        if let Some(device_id) = index.exact.get(topic) {
            return Some(device_id.clone());
        }
        let levels: Vec<&str> = topic.split('/').collect();
        index
            .patterns
            .iter()
            .find(|(segs, _)| matches(segs, &levels))
            .map(|(_, device_id)| device_id.clone())
    }

    /// One subscription per unique topic pattern across `devices`, each at
    /// the highest QoS requested by any device sharing that pattern.
    pub fn build_subscriptions(&self, devices: &[MqttDeviceConfig], global_qos: u8) -> Vec<(String, u8)> {
        let mut by_pattern: HashMap<String, u8> = HashMap::new();
        for device in devices.iter().filter(|d| d.enabled) {
            let qos = device.qos.unwrap_or(global_qos);
            for topic in &device.topics {
                if topic.is_empty() {
                    continue;
                }
                by_pattern
                    .entry(topic.clone())
                    .and_modify(|existing| *existing = (*existing).max(qos))
                    .or_insert(qos);
            }
        }
        let mut subs: Vec<(String, u8)> = by_pattern.into_iter().collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        subs
    }
}
