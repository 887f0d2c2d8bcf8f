//! The event record carried by topics, queues, and broker ports.
//!
//! Events are immutable once constructed: the id, type, payload, and
//! timestamp are fixed at publish time. Ordering inside a priority bus is
//! `priority` descending, then `timestamp_ms` ascending; the `seq` number
//! assigned at enqueue breaks ties between events minted in the same
//! millisecond.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery priority of an [`Event`].
///
/// Higher priorities dequeue first on a priority bus. Non-priority buses
/// ignore this field entirely and deliver in FIFO order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Delivered after all normal and high priority events.
    Low = 0,
    /// The default priority.
    #[default]
    Normal = 1,
    /// Delivered before normal and low priority events.
    High = 2,
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPriority::Low => write!(f, "low"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::High => write!(f, "high"),
        }
    }
}

/// An immutable message flowing through the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id within the retention window of the owning channel.
    pub id: String,
    /// Event type; equals the topic name for topic-published events.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Delivery priority.
    #[serde(default)]
    pub priority: EventPriority,
    /// Wall-clock publish time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Free-form metadata attached at publish time.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let event_type = event_type.into();
        let timestamp_ms = now_ms();
        Self {
            id: mint_event_id(timestamp_ms),
            event_type,
            payload,
            priority: EventPriority::Normal,
            timestamp_ms,
            metadata: HashMap::new(),
        }
    }

    /// Sets the delivery priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mints an event id of the form `evt_<timestamp>_<random>`.
pub fn mint_event_id(timestamp_ms: u64) -> String {
    format!("evt_{}_{}", timestamp_ms, random_suffix())
}

/// Short pseudo-random suffix for generated ids.
///
/// Collision resistance only needs to hold within one channel's retention
/// window, so a counter mixed with sub-millisecond clock entropy is enough.
pub fn random_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    format!("{:06x}", (nanos ^ count.wrapping_mul(0x9e37_79b9)) & 0xff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_numerically() {
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }

    #[test]
    fn new_event_defaults() {
        let event = Event::new("orders", serde_json::json!({"qty": 1}));
        assert_eq!(event.event_type, "orders");
        assert_eq!(event.priority, EventPriority::Normal);
        assert!(event.id.starts_with("evt_"));
        assert!(event.timestamp_ms > 0);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn builder_sets_priority_and_metadata() {
        let event = Event::new("orders", Value::Null)
            .with_priority(EventPriority::High)
            .with_metadata("source", Value::String("test".into()));
        assert_eq!(event.priority, EventPriority::High);
        assert_eq!(
            event.metadata.get("source"),
            Some(&Value::String("test".into()))
        );
    }

    #[test]
    fn minted_ids_are_unique_enough() {
        let a = mint_event_id(now_ms());
        let b = mint_event_id(now_ms());
        assert_ne!(a, b);
    }
}
