//! Root facade of the event hub.
//!
//! The hub composes the topic and queue managers, a set of hub-level
//! wildcard subscribers, and named [`EventBrokerPort`]s for outward
//! bridging. [`EventHub::emit`] routes an event to the topic whose name
//! equals the event type (if one exists), to every wildcard subscriber, and
//! to every ready broker port; the hub never assumes anything about the
//! transport behind a port.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use kiln_core::error::{HubError, HubResult};
use kiln_core::event::Event;
use kiln_core::port::{BoxedPort, PortListener};

use crate::config::ChannelConfig;
use crate::manager::{QueueManager, StopAllReport, TopicManager};
use crate::queue::Queue;
use crate::subscriber::{DeliveryReport, EventListener, SubscribeOptions, SubscriberManager};
use crate::topic::Topic;

/// In-process event hub: topics, queues, wildcard subscribers, broker ports.
pub struct EventHub {
    topics: TopicManager,
    queues: QueueManager,
    wildcard: SubscriberManager,
    ports: RwLock<HashMap<String, BoxedPort>>,
    publisher_port: RwLock<Option<BoxedPort>>,
    subscriber_port: RwLock<Option<BoxedPort>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            topics: TopicManager::new(),
            queues: QueueManager::new(),
            wildcard: SubscriberManager::new("*"),
            ports: RwLock::new(HashMap::new()),
            publisher_port: RwLock::new(None),
            subscriber_port: RwLock::new(None),
        }
    }

    /// The topic registry.
    pub fn topics(&self) -> &TopicManager {
        &self.topics
    }

    /// The queue registry.
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Creates and starts a topic.
    pub async fn create_topic(&self, name: &str, config: ChannelConfig) -> HubResult<Arc<Topic>> {
        self.topics.create(name, config).await
    }

    /// Creates and starts a queue.
    pub async fn create_queue(&self, name: &str, config: ChannelConfig) -> HubResult<Arc<Queue>> {
        self.queues.create(name, config).await
    }

    // ─── Wildcard subscribers ────────────────────────────────────────────────

    /// Subscribes to every event emitted through the hub.
    pub fn subscribe_all(&self, listener: EventListener, options: SubscribeOptions) -> String {
        self.wildcard.add(listener, options)
    }

    /// Removes a wildcard subscription.
    pub fn unsubscribe_all(&self, id: &str) -> HubResult<()> {
        if self.wildcard.remove(id) {
            Ok(())
        } else {
            Err(HubError::ResourceNotFound {
                kind: "subscription",
                name: id.to_string(),
            })
        }
    }

    // ─── Emit ────────────────────────────────────────────────────────────────

    /// Broadcasts an event through the hub.
    ///
    /// Routing: the topic named `event.event_type` (when registered), then
    /// every wildcard subscriber, then every ready broker port. Port
    /// failures are logged and do not fail the emit; a stopped or
    /// overflowing topic does.
    pub async fn emit(&self, event: Event) -> HubResult<DeliveryReport> {
        if event.event_type.is_empty() {
            return Err(HubError::EventProcessingFailed {
                channel: String::new(),
                reason: "event type must not be empty".into(),
            });
        }
        let mut report = DeliveryReport::default();

        if let Some(topic) = self.topics.get(&event.event_type).await {
            let topic_report = topic.publish_event(event.clone()).await?;
            report.processed += topic_report.processed;
            report.failed += topic_report.failed;
        }

        let wildcard_report = self.wildcard.deliver(&event).await;
        report.processed += wildcard_report.processed;
        report.failed += wildcard_report.failed;

        self.forward_to_ports(&event).await;
        Ok(report)
    }

    async fn forward_to_ports(&self, event: &Event) {
        let targets: Vec<BoxedPort> = {
            let ports = self.ports.read().await;
            let publisher = self.publisher_port.read().await;
            ports
                .values()
                .cloned()
                .chain(publisher.iter().cloned())
                .collect()
        };
        for port in targets {
            match port.is_ready() {
                Ok(true) => {
                    if let Err(error) = port.publish(event.clone()).await {
                        warn!(port = %port.name(), error = %error, "Broker port publish failed");
                    }
                }
                Ok(false) => {
                    debug!(port = %port.name(), "Broker port not ready, skipping");
                }
                Err(error) => {
                    warn!(port = %port.name(), error = %error, "Broker port readiness check failed");
                }
            }
        }
    }

    // ─── Broker ports ────────────────────────────────────────────────────────

    /// Registers a named broker port after checking it is ready.
    pub async fn connect_port(&self, port: BoxedPort) -> HubResult<()> {
        let name = port.name().to_string();
        match port.is_ready() {
            Ok(true) => {}
            Ok(false) => {
                return Err(HubError::AdapterConnectionFailed {
                    port: name,
                    reason: "port reports not ready".into(),
                });
            }
            Err(error) => {
                return Err(HubError::AdapterConnectionFailed {
                    port: name,
                    reason: error.to_string(),
                });
            }
        }
        self.ports.write().await.insert(name.clone(), port);
        info!(port = %name, "Broker port connected");
        Ok(())
    }

    /// Unsubscribes and removes a named broker port.
    pub async fn disconnect_port(&self, name: &str) -> HubResult<()> {
        let removed = self.ports.write().await.remove(name);
        let port = removed.ok_or_else(|| HubError::ResourceNotFound {
            kind: "port",
            name: name.to_string(),
        })?;
        if let Ok(true) = port.is_subscribed()
            && let Err(error) = port.unsubscribe().await
        {
            return Err(HubError::AdapterDisconnectionFailed {
                port: name.to_string(),
                reason: error.to_string(),
            });
        }
        info!(port = %name, "Broker port disconnected");
        Ok(())
    }

    /// Sets the dedicated outbound port slot.
    pub async fn set_publisher_port(&self, port: BoxedPort) {
        *self.publisher_port.write().await = Some(port);
    }

    /// Sets the dedicated inbound port slot and installs a listener that
    /// re-emits every inbound event through the hub.
    pub async fn attach_subscriber_port(self: &Arc<Self>, port: BoxedPort) -> HubResult<()> {
        let hub = Arc::downgrade(self);
        let listener: PortListener = Arc::new(move |event: Event| {
            if let Some(hub) = hub.upgrade() {
                tokio::spawn(async move {
                    if let Err(error) = hub.emit(event).await {
                        warn!(error = %error, "Inbound port event could not be emitted");
                    }
                });
            }
        });
        port.subscribe(listener)
            .await
            .map_err(|error| HubError::AdapterConnectionFailed {
                port: port.name().to_string(),
                reason: error.to_string(),
            })?;
        *self.subscriber_port.write().await = Some(port);
        Ok(())
    }

    /// Names of the connected broker ports.
    pub async fn port_names(&self) -> Vec<String> {
        self.ports.read().await.keys().cloned().collect()
    }

    // ─── Shutdown & stats ────────────────────────────────────────────────────

    /// Stops every topic and queue in parallel.
    pub async fn stop_all(&self) -> (StopAllReport, StopAllReport) {
        self.wildcard.clear();
        let topics = self.topics.stop_all().await;
        let queues = self.queues.stop_all().await;
        (topics, queues)
    }

    /// Point-in-time summary of the hub.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            topics: self.topics.count().await,
            queues: self.queues.count().await,
            ports: self.ports.read().await.len(),
            wildcard_subscribers: self.wildcard.count(),
        }
    }
}

/// Summary statistics for the hub.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub topics: usize,
    pub queues: usize,
    pub ports: usize,
    pub wildcard_subscribers: usize,
}

impl std::fmt::Display for HubStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} topic(s), {} queue(s), {} port(s), {} wildcard subscriber(s)",
            self.topics, self.queues, self.ports, self.wildcard_subscribers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePort {
        name: String,
        ready: bool,
        published: SyncMutex<Vec<Event>>,
        listener: SyncMutex<Option<PortListener>>,
        subscribed: AtomicBool,
    }

    impl FakePort {
        fn new(name: &str, ready: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ready,
                published: SyncMutex::new(Vec::new()),
                listener: SyncMutex::new(None),
                subscribed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl kiln_core::port::EventBrokerPort for FakePort {
        fn name(&self) -> &str {
            &self.name
        }

        async fn publish(&self, event: Event) -> HubResult<()> {
            self.published.lock().push(event);
            Ok(())
        }

        async fn publish_batch(&self, events: Vec<Event>) -> HubResult<()> {
            self.published.lock().extend(events);
            Ok(())
        }

        fn is_ready(&self) -> HubResult<bool> {
            Ok(self.ready)
        }

        async fn subscribe(&self, listener: PortListener) -> HubResult<()> {
            *self.listener.lock() = Some(listener);
            self.subscribed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe(&self) -> HubResult<()> {
            *self.listener.lock() = None;
            self.subscribed.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_subscribed(&self) -> HubResult<bool> {
            Ok(self.subscribed.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn emit_routes_to_matching_topic() {
        let hub = EventHub::new();
        let topic = hub.create_topic("orders", ChannelConfig::default()).await.unwrap();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        topic
            .subscribe(
                EventListener::from_sync(move |event| {
                    sink.lock().push(event.payload);
                    Ok(())
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        hub.emit(Event::new("orders", json!("hello"))).await.unwrap();
        hub.emit(Event::new("unrelated", json!("nope"))).await.unwrap();

        assert_eq!(log.lock().clone(), [json!("hello")]);
    }

    #[tokio::test]
    async fn wildcard_subscribers_see_every_event() {
        let hub = EventHub::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let id = hub.subscribe_all(
            EventListener::from_sync(move |event| {
                sink.lock().push(event.event_type);
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        hub.emit(Event::new("a", json!(1))).await.unwrap();
        hub.emit(Event::new("b", json!(2))).await.unwrap();
        assert_eq!(log.lock().clone(), ["a", "b"]);

        hub.unsubscribe_all(&id).unwrap();
        hub.emit(Event::new("c", json!(3))).await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn ready_ports_receive_forwarded_events() {
        let hub = EventHub::new();
        let port = FakePort::new("broker", true);
        hub.connect_port(port.clone()).await.unwrap();

        hub.emit(Event::new("x", json!(1))).await.unwrap();
        assert_eq!(port.published.lock().len(), 1);

        hub.disconnect_port("broker").await.unwrap();
        hub.emit(Event::new("x", json!(2))).await.unwrap();
        assert_eq!(port.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn connecting_a_not_ready_port_fails() {
        let hub = EventHub::new();
        let port = FakePort::new("broker", false);
        assert!(matches!(
            hub.connect_port(port).await,
            Err(HubError::AdapterConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn subscriber_port_events_are_re_emitted() {
        let hub = Arc::new(EventHub::new());
        let topic = hub.create_topic("inbound", ChannelConfig::default()).await.unwrap();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        topic
            .subscribe(
                EventListener::from_sync(move |event| {
                    sink.lock().push(event.payload);
                    Ok(())
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        let port = FakePort::new("upstream", true);
        hub.attach_subscriber_port(port.clone()).await.unwrap();

        let listener = port.listener.lock().clone().unwrap();
        listener(Event::new("inbound", json!("from-outside")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(log.lock().clone(), [json!("from-outside")]);
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let hub = EventHub::new();
        assert!(matches!(
            hub.emit(Event::new("", json!(1))).await,
            Err(HubError::EventProcessingFailed { .. })
        ));
    }

    #[tokio::test]
    async fn stats_reflect_registrations() {
        let hub = EventHub::new();
        hub.create_topic("t", ChannelConfig::default()).await.unwrap();
        hub.create_queue("q", ChannelConfig::default()).await.unwrap();
        let stats = hub.stats().await;
        assert_eq!(stats.topics, 1);
        assert_eq!(stats.queues, 1);
        assert_eq!(stats.to_string(), "1 topic(s), 1 queue(s), 0 port(s), 0 wildcard subscriber(s)");
    }
}
