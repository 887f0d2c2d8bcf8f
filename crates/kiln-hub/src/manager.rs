//! Named registries for topics and queues.
//!
//! A manager owns its channels exclusively: `create` validates the name,
//! constructs the right bus variant from the config, and only registers the
//! channel once it started successfully; `delete` stops the channel before
//! removing it. `stop_all` stops every channel in parallel and aggregates
//! the failures instead of aborting on the first one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tokio::sync::RwLock;
use tracing::{info, warn};

use kiln_core::error::{HubError, HubResult};

use crate::config::ChannelConfig;
use crate::metrics::ChannelMetrics;
use crate::queue::Queue;
use crate::topic::Topic;

/// Outcome of a parallel `stop_all`.
#[derive(Debug, Default)]
pub struct StopAllReport {
    /// Channels stopped cleanly.
    pub stopped: usize,
    /// Channels that failed to stop, with the failure.
    pub failures: Vec<(String, HubError)>,
}

impl StopAllReport {
    pub fn all_stopped(&self) -> bool {
        self.failures.is_empty()
    }
}

fn validate_name(kind: &'static str, name: &str, exists: bool) -> HubResult<()> {
    if name.is_empty() {
        return Err(HubError::InvalidState {
            name: format!("<unnamed {kind}>"),
            expected: "a non-empty name",
            actual: "empty",
        });
    }
    if exists {
        return Err(HubError::InvalidState {
            name: name.to_string(),
            expected: "unregistered",
            actual: "registered",
        });
    }
    Ok(())
}

// =============================================================================
// TopicManager
// =============================================================================

/// Registry of named topics.
#[derive(Default)]
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and starts a topic. Nothing is registered when start fails.
    pub async fn create(&self, name: &str, config: ChannelConfig) -> HubResult<Arc<Topic>> {
        let mut topics = self.topics.write().await;
        validate_name("topic", name, topics.contains_key(name))?;

        let topic = Arc::new(Topic::new(name, config));
        topic.start().await?;
        topics.insert(name.to_string(), Arc::clone(&topic));
        info!(topic = %name, "Topic created");
        Ok(topic)
    }

    /// Returns a topic by name.
    pub async fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().await.get(name).cloned()
    }

    /// Stops and removes a topic.
    pub async fn delete(&self, name: &str) -> HubResult<()> {
        let removed = self.topics.write().await.remove(name);
        let topic = removed.ok_or_else(|| HubError::ResourceNotFound {
            kind: "topic",
            name: name.to_string(),
        })?;
        topic.stop().await?;
        info!(topic = %name, "Topic deleted");
        Ok(())
    }

    /// All registered topic names.
    pub async fn names(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// Number of registered topics.
    pub async fn count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Metrics merged across every topic.
    pub async fn aggregate_metrics(&self) -> ChannelMetrics {
        let topics = self.topics.read().await;
        let mut total = ChannelMetrics::default();
        for topic in topics.values() {
            total.merge(&topic.metrics());
        }
        total
    }

    /// Stops every topic in parallel; failures are collected, not fatal.
    pub async fn stop_all(&self) -> StopAllReport {
        let topics: Vec<Arc<Topic>> = self.topics.write().await.drain().map(|(_, t)| t).collect();
        let results = future::join_all(topics.iter().map(|topic| topic.stop())).await;

        let mut report = StopAllReport::default();
        for (topic, result) in topics.iter().zip(results) {
            match result {
                Ok(()) => report.stopped += 1,
                Err(error) => {
                    warn!(topic = %topic.name(), error = %error, "Failed to stop topic");
                    report.failures.push((topic.name().to_string(), error));
                }
            }
        }
        report
    }
}

// =============================================================================
// QueueManager
// =============================================================================

/// Registry of named queues.
#[derive(Default)]
pub struct QueueManager {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and starts a queue. Nothing is registered when start fails.
    pub async fn create(&self, name: &str, config: ChannelConfig) -> HubResult<Arc<Queue>> {
        let mut queues = self.queues.write().await;
        validate_name("queue", name, queues.contains_key(name))?;

        let queue = Arc::new(Queue::new(name, config));
        queue.start().await?;
        queues.insert(name.to_string(), Arc::clone(&queue));
        info!(queue = %name, "Queue created");
        Ok(queue)
    }

    /// Returns a queue by name.
    pub async fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Stops and removes a queue.
    pub async fn delete(&self, name: &str) -> HubResult<()> {
        let removed = self.queues.write().await.remove(name);
        let queue = removed.ok_or_else(|| HubError::ResourceNotFound {
            kind: "queue",
            name: name.to_string(),
        })?;
        queue.stop().await?;
        info!(queue = %name, "Queue deleted");
        Ok(())
    }

    /// All registered queue names.
    pub async fn names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    /// Number of registered queues.
    pub async fn count(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Metrics merged across every queue.
    pub async fn aggregate_metrics(&self) -> ChannelMetrics {
        let queues = self.queues.read().await;
        let mut total = ChannelMetrics::default();
        for queue in queues.values() {
            total.merge(&queue.metrics());
        }
        total
    }

    /// Stops every queue in parallel; failures are collected, not fatal.
    pub async fn stop_all(&self) -> StopAllReport {
        let queues: Vec<Arc<Queue>> = self.queues.write().await.drain().map(|(_, q)| q).collect();
        let results = future::join_all(queues.iter().map(|queue| queue.stop())).await;

        let mut report = StopAllReport::default();
        for (queue, result) in queues.iter().zip(results) {
            match result {
                Ok(()) => report.stopped += 1,
                Err(error) => {
                    warn!(queue = %queue.name(), error = %error, "Failed to stop queue");
                    report.failures.push((queue.name().to_string(), error));
                }
            }
        }
        report
    }
}
