//! Event hub for the Kiln application kernel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── EventHub ────────────────────────┐
//! │  TopicManager          QueueManager        broker ports  │
//! │      │                      │                            │
//! │   Topic ──┬─ MessageBus   Queue ──┬─ MessageBus          │
//! │           ├─ SubscriberManager    └─ MetricsTracker      │
//! │           └─ MetricsTracker                              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Topics** fan events out to prioritized subscribers with per-subscriber
//!   retry; **queues** hand each message to exactly one receiver.
//! - Each channel owns an ordered bounded [`bus`](crate::bus) (FIFO or
//!   priority heap) with periodic retention GC.
//! - The hub routes [`emit`](crate::hub::EventHub::emit)ted events by type,
//!   feeds wildcard subscribers, and bridges outward through
//!   [`EventBrokerPort`](kiln_core::port::EventBrokerPort)s.

pub mod bus;
pub mod config;
mod gc;
pub mod hub;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod subscriber;
pub mod topic;

pub use bus::{ArrayBus, HeapBus, MessageBus};
pub use config::ChannelConfig;
pub use hub::{EventHub, HubStats};
pub use manager::{QueueManager, StopAllReport, TopicManager};
pub use metrics::{ChannelMetrics, MetricsTracker, PROCESSING_RING_SIZE};
pub use queue::Queue;
pub use subscriber::{
    BoxError, DeliveryReport, EventFilter, EventListener, SubscribeOptions, SubscriberManager,
    Subscription,
};
pub use topic::Topic;
