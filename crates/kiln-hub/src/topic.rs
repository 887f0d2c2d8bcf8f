//! Named publish/subscribe channel with fan-out delivery.
//!
//! A topic composes a [`MessageBus`](crate::bus::MessageBus) (FIFO or
//! priority heap, per config), a [`SubscriberManager`], and a
//! [`MetricsTracker`]. Published messages are buffered on the bus and
//! drained to subscribers in bus order; while a topic has no subscribers,
//! messages stay buffered (bounded by `max_size` and the retention window),
//! and the backlog is flushed as soon as the first subscriber arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kiln_core::error::{HubError, HubResult};
use kiln_core::event::{Event, EventPriority, mint_event_id, now_ms};

use crate::bus::bus_for;
use crate::config::ChannelConfig;
use crate::gc::{SharedBus, spawn_retention_gc};
use crate::metrics::{ChannelMetrics, MetricsTracker};
use crate::subscriber::{DeliveryReport, EventListener, SubscribeOptions, SubscriberManager};

/// A named pub/sub channel.
pub struct Topic {
    name: String,
    config: ChannelConfig,
    bus: SharedBus,
    subscribers: SubscriberManager,
    metrics: MetricsTracker,
    running: AtomicBool,
    gc_token: Mutex<Option<CancellationToken>>,
}

impl Topic {
    /// Creates a stopped topic; call [`Topic::start`] before publishing.
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        let name = name.into();
        let bus: SharedBus = Arc::new(Mutex::new(bus_for(&name, &config)));
        Self {
            subscribers: SubscriberManager::new(name.clone()),
            metrics: MetricsTracker::new(),
            bus,
            name,
            config,
            running: AtomicBool::new(false),
            gc_token: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the topic and its retention GC task.
    ///
    /// Starting a running topic is an error, not a no-op.
    pub async fn start(&self) -> HubResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(self.state_error("stopped", "running"));
        }
        let token = spawn_retention_gc(
            self.name.clone(),
            Arc::clone(&self.bus),
            self.config.retention_ms,
            self.config.gc_interval_ms,
        );
        *self.gc_token.lock() = Some(token);
        info!(topic = %self.name, "Topic started");
        Ok(())
    }

    /// Stops the topic: cancels GC, clears the bus and the subscriber set.
    pub async fn stop(&self) -> HubResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(self.state_error("running", "stopped"));
        }
        if let Some(token) = self.gc_token.lock().take() {
            token.cancel();
        }
        self.bus.lock().clear();
        self.subscribers.clear();
        info!(topic = %self.name, "Topic stopped");
        Ok(())
    }

    /// Publishes a payload as a new event.
    ///
    /// The event id is minted here; priority is read from a `"priority"`
    /// metadata entry when present (ignored by non-priority topics at
    /// dequeue time).
    pub async fn publish(
        &self,
        payload: Value,
        metadata: Option<HashMap<String, Value>>,
    ) -> HubResult<DeliveryReport> {
        let metadata = metadata.unwrap_or_default();
        let priority = metadata
            .get("priority")
            .and_then(|value| serde_json::from_value::<EventPriority>(value.clone()).ok())
            .unwrap_or_default();
        let timestamp_ms = now_ms();
        let event = Event {
            id: mint_event_id(timestamp_ms),
            event_type: self.name.clone(),
            payload,
            priority,
            timestamp_ms,
            metadata,
        };
        self.publish_event(event).await
    }

    /// Publishes an already-constructed event (hub `emit` path).
    pub async fn publish_event(&self, event: Event) -> HubResult<DeliveryReport> {
        if !self.is_running() {
            return Err(self.state_error("running", "stopped"));
        }
        self.bus.lock().enqueue(event)?;
        self.metrics.mark_published();
        Ok(self.drain().await)
    }

    /// Registers a listener; flushes any buffered backlog to it.
    pub async fn subscribe(
        &self,
        listener: EventListener,
        options: SubscribeOptions,
    ) -> HubResult<String> {
        let id = self.subscribers.add(listener, options);
        if self.is_running() {
            self.drain().await;
        }
        Ok(id)
    }

    /// Removes a subscription; unknown ids are an error.
    pub fn unsubscribe(&self, id: &str) -> HubResult<()> {
        if self.subscribers.remove(id) {
            Ok(())
        } else {
            Err(HubError::ResourceNotFound {
                kind: "subscription",
                name: id.to_string(),
            })
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.count()
    }

    /// Buffered messages not yet delivered.
    pub fn depth(&self) -> usize {
        self.bus.lock().len()
    }

    /// Buffered messages in dequeue order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.bus.lock().snapshot()
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> ChannelMetrics {
        self.metrics
            .snapshot(self.depth(), self.subscribers.count())
    }

    /// Drains buffered events to the current subscriber set in bus order.
    async fn drain(&self) -> DeliveryReport {
        let mut total = DeliveryReport::default();
        if self.subscribers.is_empty() {
            return total;
        }
        loop {
            // Pop outside the delivery await so the bus lock is never held
            // across a suspension point.
            let event = match self.bus.lock().dequeue() {
                Some(event) => event,
                None => break,
            };
            let report = self.subscribers.deliver(&event).await;
            self.metrics
                .record_delivery(report.processed, report.failed, report.average_time_ms);
            total.processed += report.processed;
            total.failed += report.failed;
            total.average_time_ms = report.average_time_ms;
        }
        total
    }

    fn state_error(&self, expected: &'static str, actual: &'static str) -> HubError {
        HubError::InvalidState {
            name: self.name.clone(),
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn recording(log: Arc<SyncMutex<Vec<Value>>>) -> EventListener {
        EventListener::from_sync(move |event| {
            log.lock().push(event.payload);
            Ok(())
        })
    }

    #[tokio::test]
    async fn double_start_is_an_error() {
        let topic = Topic::new("t", ChannelConfig::default());
        topic.start().await.unwrap();
        assert!(matches!(
            topic.start().await,
            Err(HubError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn publish_requires_running() {
        let topic = Topic::new("t", ChannelConfig::default());
        assert!(matches!(
            topic.publish(Value::Null, None).await,
            Err(HubError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn priority_backlog_is_delivered_in_heap_order() {
        let topic = Topic::new("t", ChannelConfig::priority().with_max_size(10));
        topic.start().await.unwrap();

        let meta = |p: &str| {
            let mut m = HashMap::new();
            m.insert("priority".to_string(), json!(p));
            Some(m)
        };
        topic.publish(json!("m1"), meta("normal")).await.unwrap();
        topic.publish(json!("m2"), meta("high")).await.unwrap();
        topic.publish(json!("m3"), meta("low")).await.unwrap();
        topic.publish(json!("m4"), meta("high")).await.unwrap();

        let log = Arc::new(SyncMutex::new(Vec::new()));
        topic
            .subscribe(recording(Arc::clone(&log)), SubscribeOptions::default())
            .await
            .unwrap();

        let received: Vec<Value> = log.lock().clone();
        assert_eq!(received, [json!("m2"), json!("m4"), json!("m1"), json!("m3")]);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let topic = Topic::new("t", ChannelConfig::priority());
        topic.start().await.unwrap();
        for payload in ["m1", "m2", "m3"] {
            topic.publish(json!(payload), None).await.unwrap();
        }

        let log = Arc::new(SyncMutex::new(Vec::new()));
        topic
            .subscribe(recording(Arc::clone(&log)), SubscribeOptions::default())
            .await
            .unwrap();

        let received: Vec<Value> = log.lock().clone();
        assert_eq!(received, [json!("m1"), json!("m2"), json!("m3")]);
    }

    #[tokio::test]
    async fn capacity_overflow_surfaces_resource_unavailable() {
        let topic = Topic::new("t", ChannelConfig::default().with_max_size(2));
        topic.start().await.unwrap();
        topic.publish(json!("m1"), None).await.unwrap();
        topic.publish(json!("m2"), None).await.unwrap();
        assert!(matches!(
            topic.publish(json!("m3"), None).await,
            Err(HubError::ResourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn publish_after_subscribe_delivers_immediately() {
        let topic = Topic::new("t", ChannelConfig::default());
        topic.start().await.unwrap();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        topic
            .subscribe(recording(Arc::clone(&log)), SubscribeOptions::default())
            .await
            .unwrap();

        let report = topic.publish(json!("live"), None).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(log.lock().len(), 1);
        assert_eq!(topic.depth(), 0);
    }

    #[tokio::test]
    async fn counter_consistency_for_single_subscriber() {
        let topic = Topic::new("t", ChannelConfig::default());
        topic.start().await.unwrap();
        topic
            .subscribe(EventListener::from_sync(|_| Ok(())), SubscribeOptions::default())
            .await
            .unwrap();
        for i in 0..5 {
            topic.publish(json!(i), None).await.unwrap();
        }
        let metrics = topic.metrics();
        assert_eq!(metrics.messages_published, 5);
        assert!(metrics.messages_published >= metrics.messages_consumed + metrics.failed_messages);
        assert_eq!(metrics.publications_completed, 5);
    }

    #[tokio::test]
    async fn failed_delivery_is_counted_on_topic_metrics() {
        let topic = Topic::new("t", ChannelConfig::default());
        topic.start().await.unwrap();
        topic
            .subscribe(
                EventListener::from_sync(|_| Err("no".into())),
                SubscribeOptions {
                    max_retries: 2,
                    retry_delay_ms: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        topic.publish(json!("x"), None).await.unwrap();
        let metrics = topic.metrics();
        assert_eq!(metrics.failed_messages, 1);
        assert_eq!(metrics.publications_completed, 0);
    }

    #[tokio::test]
    async fn stop_clears_bus_and_subscribers() {
        let topic = Topic::new("t", ChannelConfig::default());
        topic.start().await.unwrap();
        topic.publish(json!("m1"), None).await.unwrap();
        topic
            .subscribe(EventListener::from_sync(|_| Ok(())), SubscribeOptions::default())
            .await
            .unwrap();

        topic.stop().await.unwrap();
        assert_eq!(topic.depth(), 0);
        assert_eq!(topic.subscriber_count(), 0);
        assert!(matches!(topic.stop().await, Err(HubError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_resource_not_found() {
        let topic = Topic::new("t", ChannelConfig::default());
        assert!(matches!(
            topic.unsubscribe("missing"),
            Err(HubError::ResourceNotFound { kind: "subscription", .. })
        ));
    }
}
