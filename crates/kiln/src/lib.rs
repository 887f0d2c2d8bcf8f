//! # Kiln
//!
//! An embeddable in-process application kernel composing two tightly
//! coupled subsystems:
//!
//! - an **event hub** — point-to-point queues and publish/subscribe topics
//!   with priority ordering, per-subscriber retry, and bounded retention;
//! - a **plugin engine** — loads, orders, initializes, starts, stops, and
//!   tears down extension units, giving them a shared service registry and
//!   the hub.
//!
//! An **application context** orchestrates both under a single phase
//! machine and bridges events between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────── ApplicationContext ───────────────┐
//! │                                                 │
//! │  EventHub                    PluginEngine       │
//! │  ├─ TopicManager ─ Topic     ├─ loaders         │
//! │  ├─ QueueManager ─ Queue     ├─ PluginRegistry  │
//! │  └─ broker ports             ├─ resolver        │
//! │                              └─ lifecycle       │
//! │            ServiceRegistry (shared)             │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kiln::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = Arc::new(RuntimeLoader::default());
//!     loader.register_instance("audit", AuditPlugin::new())?;
//!
//!     let mut engine = PluginEngine::new(Arc::new(ServiceRegistry::new()));
//!     engine.add_loader(loader);
//!
//!     let context = ApplicationContext::new(engine);
//!     context.initialize(vec![PluginConfig::new("audit")]).await?;
//!     context.start().await?;
//!
//!     let topic = context.hub().create_topic("orders", ChannelConfig::priority()).await?;
//!     topic.subscribe(
//!         EventListener::from_sync(|event| {
//!             println!("order: {}", event.payload);
//!             Ok(())
//!         }),
//!         SubscribeOptions::default(),
//!     ).await?;
//!     topic.publish(serde_json::json!({"qty": 2}), None).await?;
//!
//!     context.stop().await?;
//!     Ok(())
//! }
//! ```

// Core contracts and data model
pub use kiln_core::*;

// Subsystems
pub use kiln_engine;
pub use kiln_hub;
pub use kiln_runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use kiln::prelude::*;
/// ```
pub mod prelude {
    // Orchestration - main entry point
    pub use kiln_runtime::{ApplicationContext, ApplicationPhase, ContextError};

    // Event hub surface
    pub use kiln_hub::{
        ChannelConfig, EventHub, EventListener, Queue, SubscribeOptions, Topic,
    };

    // Plugin engine surface
    pub use kiln_engine::{
        FilesystemLoader, FilesystemLoaderConfig, PluginEngine, RuntimeLoader,
    };

    // Core contracts plugins implement and consume
    pub use kiln_core::{
        Event, EventPriority, Plugin, PluginConfig, PluginState, ServiceLifetime, ServiceRegistry,
    };
}
