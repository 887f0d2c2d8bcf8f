//! Channel configuration shared by topics and queues.

use serde::{Deserialize, Serialize};

/// Default bound on in-flight messages per channel.
pub const DEFAULT_MAX_SIZE: usize = 1000;
/// Default retention window: 24 hours.
pub const DEFAULT_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;
/// Default retention GC interval: 1 hour.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Configuration for a topic or queue.
///
/// `priority_queue` selects the bus implementation: a heap ordered by
/// priority descending then timestamp ascending, or a plain FIFO. On a
/// non-priority channel, event priorities are silently ignored; messages
/// always dequeue in publish order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum number of retained messages; enqueue past this fails.
    pub max_size: usize,
    /// Advisory flag carried through metrics; the hub itself never persists
    /// messages across restarts.
    pub persistent: bool,
    /// Use a priority heap instead of FIFO ordering.
    pub priority_queue: bool,
    /// Messages older than this are eligible for retention GC.
    pub retention_ms: u64,
    /// How often the retention GC task runs.
    pub gc_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            persistent: false,
            priority_queue: false,
            retention_ms: DEFAULT_RETENTION_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl ChannelConfig {
    /// Config with a priority heap bus.
    pub fn priority() -> Self {
        Self {
            priority_queue: true,
            ..Self::default()
        }
    }

    /// Sets the capacity bound.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the retention window.
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.retention_ms = retention_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.max_size, 1000);
        assert!(!cfg.priority_queue);
        assert_eq!(cfg.retention_ms, 86_400_000);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let cfg: ChannelConfig =
            serde_json::from_value(serde_json::json!({"max_size": 10, "priority_queue": true}))
                .unwrap();
        assert_eq!(cfg.max_size, 10);
        assert!(cfg.priority_queue);
        assert_eq!(cfg.retention_ms, DEFAULT_RETENTION_MS);
    }
}
