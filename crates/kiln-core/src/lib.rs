//! Core contracts and data model for the Kiln application kernel.
//!
//! This crate defines everything the hub and the engine agree on:
//!
//! - The [`Event`] record and [`EventPriority`] ordering.
//! - The error taxonomy ([`HubError`], [`EngineError`]) with recovery hints.
//! - The [`Plugin`] contract, its state machines, config, and metadata.
//! - The [`PluginLoader`] strategy contract.
//! - The [`EventBrokerPort`] bridging contract.
//! - The [`ServiceRegistry`] plugins share capabilities through.
//!
//! Higher layers live in `kiln-hub` (topics, queues, delivery), in
//! `kiln-engine` (loading, ordering, lifecycle), and in `kiln-runtime`
//! (the application context binding both).

pub mod error;
pub mod event;
pub mod loader;
pub mod plugin;
pub mod port;
pub mod service;

pub use error::{EngineError, EngineResult, HubError, HubResult, RecoveryHint};
pub use event::{Event, EventPriority, now_ms};
pub use loader::{BoxedLoader, PluginLoader};
pub use plugin::{
    BoxedPlugin, EngineState, HealthStatus, Plugin, PluginConfig, PluginHealth, PluginLookup,
    PluginMetadata, PluginState, PluginType, StateCell,
};
pub use port::{BoxedPort, EventBrokerPort, PortListener};
pub use service::{ServiceFactory, ServiceInstance, ServiceLifetime, ServiceRegistry};
