//! Named point-to-point channel with pull semantics.
//!
//! Unlike a [`Topic`](crate::topic::Topic), a queue never fans out:
//! [`Queue::receive`] removes and returns exactly one message, and each
//! message is observed by at most one consumer.

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

/// A named single-consumer channel.
pub struct Queue {
    name: String,
    config: ChannelConfig,
    bus: SharedBus,
    metrics: MetricsTracker,
    running: AtomicBool,
    gc_token: Mutex<Option<CancellationToken>>,
}

impl Queue {
    /// Creates a stopped queue; call [`Queue::start`] before sending.
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        let name = name.into();
        let bus: SharedBus = Arc::new(Mutex::new(bus_for(&name, &config)));
        Self {
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

    /// Starts the queue and its retention GC task.
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
        info!(queue = %self.name, "Queue started");
        Ok(())
    }

    /// Stops the queue, cancelling GC and dropping buffered messages.
    pub async fn stop(&self) -> HubResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(self.state_error("running", "stopped"));
        }
        if let Some(token) = self.gc_token.lock().take() {
            token.cancel();
        }
        self.bus.lock().clear();
        info!(queue = %self.name, "Queue stopped");
        Ok(())
    }

    /// Enqueues a payload as a new message.
    pub async fn send(
        &self,
        payload: Value,
        metadata: Option<HashMap<String, Value>>,
    ) -> HubResult<()> {
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
        self.send_event(event).await
    }

    /// Enqueues an already-constructed event.
    pub async fn send_event(&self, event: Event) -> HubResult<()> {
        if !self.is_running() {
            return Err(self.state_error("running", "stopped"));
        }
        self.bus.lock().enqueue(event)?;
        self.metrics.mark_published();
        Ok(())
    }

    /// Removes and returns one message in bus order, if any.
    pub fn receive(&self) -> Option<Event> {
        let event = self.bus.lock().dequeue();
        if event.is_some() {
            self.metrics.mark_received();
        }
        event
    }

    /// Buffered messages not yet received.
    pub fn depth(&self) -> usize {
        self.bus.lock().len()
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> ChannelMetrics {
        self.metrics.snapshot(self.depth(), 0)
    }

    fn state_error(&self, expected: &'static str, actual: &'static str) -> HubError {
        HubError::InvalidState {
            name: self.name.clone(),
            expected,
            actual,
        }
    }
}
