//! Broker port contract for bridging the hub to an external transport.
//!
//! The hub is agnostic to what sits behind a port: a message broker, a
//! process-local shim, a test double. Ports are registered on the
//! [`EventHub`] by name; outbound events are forwarded through
//! [`EventBrokerPort::publish`], and a port can push inbound events back by
//! invoking the listener handed to [`EventBrokerPort::subscribe`].
//!
//! [`EventHub`]: https://docs.rs/kiln-hub

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HubResult;
use crate::event::Event;

/// Callback a port invokes for each inbound event.
pub type PortListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Transport-agnostic bridge endpoint.
#[async_trait]
pub trait EventBrokerPort: Send + Sync {
    /// Stable port name used as the registration key.
    fn name(&self) -> &str;

    /// Forwards one event to the external side.
    async fn publish(&self, event: Event) -> HubResult<()>;

    /// Forwards a batch of events to the external side.
    async fn publish_batch(&self, events: Vec<Event>) -> HubResult<()>;

    /// Whether the port can currently accept publishes.
    fn is_ready(&self) -> HubResult<bool>;

    /// Installs the inbound listener; replaces any previous one.
    async fn subscribe(&self, listener: PortListener) -> HubResult<()>;

    /// Removes the inbound listener.
    async fn unsubscribe(&self) -> HubResult<()>;

    /// Whether an inbound listener is installed.
    fn is_subscribed(&self) -> HubResult<bool>;
}

/// A shared port trait object.
pub type BoxedPort = Arc<dyn EventBrokerPort>;
