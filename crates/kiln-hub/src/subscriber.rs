//! Per-topic subscriber set and fan-out delivery.
//!
//! Subscribers are invoked in priority order (descending, insertion order
//! breaking ties). Each subscriber has its own retry budget; a failing or
//! panicking listener is retried after `retry_delay_ms` and abandoned once
//! the budget is spent. One subscriber's failure never aborts delivery to
//! the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, warn};

use kiln_core::event::{Event, now_ms, random_suffix};

/// Boxed error returned by listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ListenerFn = dyn Fn(Event) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// An event callback, always awaited by the delivery loop.
///
/// Synchronous listeners are adapted to the async protocol at registration
/// via [`EventListener::from_sync`], so the delivery path has a single
/// shape.
#[derive(Clone)]
pub struct EventListener(Arc<ListenerFn>);

impl EventListener {
    /// Wraps an async closure.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self(Arc::new(move |event| f(event).boxed()))
    }

    /// Adapts a synchronous closure to the async protocol.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self(Arc::new(move |event| {
            let result = f(event);
            async move { result }.boxed()
        }))
    }

    async fn invoke(&self, event: Event) -> Result<(), BoxError> {
        (self.0)(event).await
    }
}

/// Predicate deciding whether a subscriber sees an event.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Per-subscription delivery options.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Retries after the initial attempt; a listener is invoked at most
    /// `1 + max_retries` times per event.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay_ms: u64,
    /// Delivery order among subscribers; higher goes first.
    pub priority: i32,
    /// Events failing the filter are skipped and counted as delivered.
    pub filter: Option<EventFilter>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            priority: 0,
            filter: None,
        }
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A registered listener on one topic.
pub struct Subscription {
    id: String,
    topic: String,
    listener: EventListener,
    options: SubscribeOptions,
    created_at_ms: u64,
    serial: u64,
    active: AtomicBool,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Filter-passed, non-failing deliveries to this subscriber.
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Deliveries abandoned after the retry budget.
    pub fn messages_failed(&self) -> u64 {
        self.messages_failed.load(Ordering::Relaxed)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Aggregate result of delivering one event to a topic's subscribers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Successful deliveries, including filter skips.
    pub processed: usize,
    /// Deliveries abandoned after retries.
    pub failed: usize,
    /// Mean listener time across successful invocations, milliseconds.
    pub average_time_ms: f64,
}

/// The subscriber set of one topic.
pub struct SubscriberManager {
    topic: String,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    next_serial: AtomicU64,
}

impl SubscriberManager {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscriptions: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Registers a listener and returns the subscription id.
    pub fn add(&self, listener: EventListener, options: SubscribeOptions) -> String {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-sub-{}-{}", self.topic, serial, random_suffix());
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            topic: self.topic.clone(),
            listener,
            options,
            created_at_ms: now_ms(),
            serial,
            active: AtomicBool::new(true),
            messages_processed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
        });
        self.subscriptions.write().insert(id.clone(), subscription);
        debug!(topic = %self.topic, subscription = %id, "Subscriber added");
        id
    }

    /// Deactivates and removes a subscription. Returns `false` when the id
    /// is unknown.
    ///
    /// Once this returns, no further listener call happens for the id: the
    /// delivery loop re-checks activity right before each invocation.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.subscriptions.write().remove(id);
        match removed {
            Some(subscription) => {
                subscription.deactivate();
                debug!(topic = %self.topic, subscription = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Returns a subscription handle by id.
    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(id).cloned()
    }

    /// Number of registered subscriptions.
    pub fn count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Whether no subscribers are registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Deactivates and drops every subscription.
    pub fn clear(&self) {
        let mut subscriptions = self.subscriptions.write();
        for subscription in subscriptions.values() {
            subscription.deactivate();
        }
        subscriptions.clear();
    }

    /// Active subscriptions in delivery order: priority descending,
    /// insertion order within a priority.
    fn delivery_order(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        subs.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then_with(|| a.serial.cmp(&b.serial))
        });
        subs
    }

    /// Delivers one event to every active subscriber.
    ///
    /// Listener panics are caught and treated as failed attempts, so a
    /// misbehaving subscriber can never unwind through `publish`.
    pub async fn deliver(&self, event: &Event) -> DeliveryReport {
        let subscribers = self.delivery_order();
        let mut report = DeliveryReport::default();
        let mut times_ms: Vec<f64> = Vec::new();

        for subscription in subscribers {
            // Unsubscribed mid-delivery: skip without counting.
            if !subscription.is_active() {
                continue;
            }

            if let Some(filter) = &subscription.options.filter
                && !filter(event)
            {
                report.processed += 1;
                continue;
            }

            let mut retry_count = 0u32;
            loop {
                let started = Instant::now();
                let attempt = std::panic::AssertUnwindSafe(
                    subscription.listener.invoke(event.clone()),
                )
                .catch_unwind()
                .await;

                let failure = match attempt {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => Some(error.to_string()),
                    Err(panic) => Some(panic_reason(&panic)),
                };

                match failure {
                    None => {
                        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                        subscription
                            .messages_processed
                            .fetch_add(1, Ordering::Relaxed);
                        report.processed += 1;
                        times_ms.push(elapsed);
                        break;
                    }
                    Some(reason) => {
                        retry_count += 1;
                        if retry_count > subscription.options.max_retries {
                            subscription.messages_failed.fetch_add(1, Ordering::Relaxed);
                            report.failed += 1;
                            let error = kiln_core::error::HubError::EventDeliveryFailed {
                                subscription: subscription.id.clone(),
                                attempts: retry_count,
                                reason,
                            };
                            warn!(
                                topic = %self.topic,
                                error = %error,
                                "Delivery abandoned after exhausting retries"
                            );
                            break;
                        }
                        debug!(
                            topic = %self.topic,
                            subscription = %subscription.id,
                            attempt = retry_count,
                            error = %reason,
                            "Listener failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(
                            subscription.options.retry_delay_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        if !times_ms.is_empty() {
            report.average_time_ms = times_ms.iter().sum::<f64>() / times_ms.len() as f64;
        }
        report
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("listener panicked: {message}")
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn recording_listener(log: Arc<Mutex<Vec<String>>>, tag: &str) -> EventListener {
        let tag = tag.to_string();
        EventListener::from_sync(move |event| {
            log.lock().push(format!("{tag}:{}", event.id));
            Ok(())
        })
    }

    fn test_event(id: &str) -> Event {
        let mut event = Event::new("t", serde_json::Value::Null);
        event.id = id.to_string();
        event
    }

    #[tokio::test]
    async fn delivers_in_priority_order_with_insertion_tiebreak() {
        let manager = SubscriberManager::new("t");
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.add(
            recording_listener(Arc::clone(&log), "low"),
            SubscribeOptions {
                priority: 1,
                ..Default::default()
            },
        );
        manager.add(
            recording_listener(Arc::clone(&log), "high"),
            SubscribeOptions {
                priority: 5,
                ..Default::default()
            },
        );
        manager.add(
            recording_listener(Arc::clone(&log), "high2"),
            SubscribeOptions {
                priority: 5,
                ..Default::default()
            },
        );

        let report = manager.deliver(&test_event("e1")).await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);
        let order: Vec<String> = log.lock().clone();
        assert_eq!(order, ["high:e1", "high2:e1", "low:e1"]);
    }

    #[tokio::test]
    async fn retry_budget_is_exact() {
        let manager = SubscriberManager::new("t");
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);

        let id = manager.add(
            EventListener::from_sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("always fails".into())
            }),
            SubscribeOptions {
                max_retries: 2,
                retry_delay_ms: 10,
                ..Default::default()
            },
        );

        let report = manager.deliver(&test_event("e1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(manager.get(&id).unwrap().messages_failed(), 1);
    }

    #[tokio::test]
    async fn retry_count_resets_between_events() {
        let manager = SubscriberManager::new("t");
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);

        manager.add(
            EventListener::from_sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("nope".into())
            }),
            SubscribeOptions {
                max_retries: 1,
                retry_delay_ms: 1,
                ..Default::default()
            },
        );

        manager.deliver(&test_event("e1")).await;
        manager.deliver(&test_event("e2")).await;
        // Two invocations per event: initial attempt + one retry.
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn one_failing_subscriber_does_not_abort_the_rest() {
        let manager = SubscriberManager::new("t");
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.add(
            EventListener::from_sync(|_| Err("broken".into())),
            SubscribeOptions {
                max_retries: 0,
                priority: 10,
                ..Default::default()
            },
        );
        manager.add(recording_listener(Arc::clone(&log), "ok"), SubscribeOptions::default());

        let report = manager.deliver(&test_event("e1")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn panicking_listener_counts_as_failure() {
        let manager = SubscriberManager::new("t");
        manager.add(
            EventListener::from_sync(|_| panic!("kaboom")),
            SubscribeOptions {
                max_retries: 0,
                ..Default::default()
            },
        );

        let report = manager.deliver(&test_event("e1")).await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn filtered_events_count_as_delivered_but_not_processed() {
        let manager = SubscriberManager::new("t");
        let id = manager.add(
            EventListener::from_sync(|_| Ok(())),
            SubscribeOptions {
                filter: Some(Arc::new(|event: &Event| event.id == "wanted")),
                ..Default::default()
            },
        );

        let report = manager.deliver(&test_event("unwanted")).await;
        assert_eq!(report.processed, 1);
        assert_eq!(manager.get(&id).unwrap().messages_processed(), 0);

        manager.deliver(&test_event("wanted")).await;
        assert_eq!(manager.get(&id).unwrap().messages_processed(), 1);
    }

    #[tokio::test]
    async fn no_delivery_after_unsubscribe() {
        let manager = SubscriberManager::new("t");
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = manager.add(recording_listener(Arc::clone(&log), "x"), SubscribeOptions::default());

        manager.deliver(&test_event("e1")).await;
        assert!(manager.remove(&id));
        manager.deliver(&test_event("e2")).await;

        assert_eq!(log.lock().len(), 1);
        assert!(!manager.remove(&id));
    }

    #[test]
    fn subscription_ids_carry_topic_prefix() {
        let manager = SubscriberManager::new("orders");
        let id = manager.add(EventListener::from_sync(|_| Ok(())), SubscribeOptions::default());
        assert!(id.starts_with("orders-sub-0-"));
    }
}
