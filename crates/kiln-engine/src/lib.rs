//! Plugin engine for the Kiln application kernel.
//!
//! # Architecture
//!
//! ```text
//! configs ──► PluginEngine ──► loaders ──► PluginRegistry
//!                  │                            │
//!                  ├── DependencyResolver ──────┤ (startup order)
//!                  └── LifecycleManager ────────┘ (guarded calls)
//! ```
//!
//! The [`PluginEngine`] drives the whole flow: find a loader for each
//! enabled [`PluginConfig`](kiln_core::plugin::PluginConfig), register the
//! loaded plugin, resolve a dependency-respecting startup order, then walk
//! the order through initialize/start and its reverse through
//! stop/cleanup. Failures during `initialize` abort; the other phases are
//! best-effort and report through the engine's lifecycle hook.

pub mod engine;
pub mod lifecycle;
pub mod loader;
pub mod registry;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testkit;

pub use engine::{EngineStats, HookPhase, LifecycleHook, PluginEngine};
pub use lifecycle::{BatchReport, FailureHook, LifecycleManager, LifecycleOp, TransitionReport};
pub use loader::{
    DescriptorFactory, DescriptorPlugin, FilesystemLoader, FilesystemLoaderConfig, RuntimeFactory,
    RuntimeLoader, RuntimeLoaderConfig,
};
pub use registry::{PluginRecord, PluginRegistry};
pub use resolver::{DependencyResolver, ResolutionPlan};
