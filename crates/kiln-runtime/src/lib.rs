//! Runtime orchestration layer for the Kiln application kernel.
//!
//! Hosts the [`ApplicationContext`], the phase machine binding one event
//! hub and one plugin engine, plus per-subsystem health tracking and the
//! logging bootstrap.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_runtime::{ApplicationContext, logging::LoggingBuilder};
//! use kiln_engine::{PluginEngine, RuntimeLoader};
//!
//! LoggingBuilder::new().init();
//!
//! let loader = Arc::new(RuntimeLoader::default());
//! loader.register_instance("audit", audit_plugin)?;
//!
//! let mut engine = PluginEngine::new(Arc::new(ServiceRegistry::new()));
//! engine.add_loader(loader);
//!
//! let context = ApplicationContext::new(engine);
//! context.run(configs).await?;
//! ```

pub mod context;
pub mod error;
pub mod health;
pub mod logging;

pub use context::{ApplicationContext, ApplicationPhase, ContextEventHandler, ContextStats};
pub use error::{ContextError, ContextResult};
pub use health::{ContextHealth, ERROR_RING_SIZE, HealthEntry, Subsystem};
pub use logging::{LoggingBuilder, SpanEvents};
