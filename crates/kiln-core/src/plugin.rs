//! The plugin contract consumed by the engine.
//!
//! A plugin is a runtime-loaded unit implementing [`Plugin`]. The engine
//! drives it through `initialize → start → stop → cleanup` and observes the
//! plugin's self-reported [`PluginState`] after every call. Plugins receive
//! a [`PluginLookup`] during initialization for intra-plugin dependency
//! access and the shared [`ServiceRegistry`] on start.
//!
//! State advancement is the plugin's own responsibility: after a successful
//! call the plugin must have moved its observable state to the expected next
//! state (`Loaded` after initialize, `Active` after start, `Suspended` after
//! stop, `Unloaded` after cleanup). Non-advancement is logged as a warning
//! by the lifecycle manager, never treated as a hard failure.
//!
//! [`ServiceRegistry`]: crate::service::ServiceRegistry

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::event::now_ms;
use crate::service::ServiceRegistry;

// =============================================================================
// State machines
// =============================================================================

/// Observable lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Known to the registry, not yet loaded.
    Registered,
    /// Loaded and (once `initialize` succeeds) ready to start.
    Loaded,
    /// Started and participating in the application.
    Active,
    /// Stopped after having been active.
    Suspended,
    /// A lifecycle operation failed; only cleanup is permitted.
    Failed,
    /// Cleaned up; terminal.
    Unloaded,
}

impl PluginState {
    /// Whether the transition `self → next` is legal.
    ///
    /// Legal transitions:
    ///
    /// ```text
    /// Registered → Loaded → Active → Suspended → Unloaded
    ///   any → Failed
    ///   Loaded → Unloaded   (cleanup without start)
    ///   Failed → Unloaded   (cleanup after failure)
    /// ```
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Registered, Loaded)
                | (Loaded, Active)
                | (Loaded, Unloaded)
                | (Active, Suspended)
                | (Suspended, Unloaded)
                | (Failed, Unloaded)
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginState::Registered => "registered",
            PluginState::Loaded => "loaded",
            PluginState::Active => "active",
            PluginState::Suspended => "suspended",
            PluginState::Failed => "failed",
            PluginState::Unloaded => "unloaded",
        };
        write!(f, "{name}")
    }
}

/// Engine-level phase machine.
///
/// Legal path is `Stopped → Initializing → Running → Stopping → Stopped`;
/// cleanup returns the engine to `Stopped` from anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Not initialized, or fully torn down.
    #[default]
    Stopped,
    /// `initialize` completed; plugins are loaded and initialized.
    Initializing,
    /// `start` completed.
    Running,
    /// `stop` in progress or completed; awaiting cleanup.
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Initializing => "initializing",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// Functional category of a plugin.
///
/// Load order is `System ≺ Library ≺ User`; within one category plugins
/// order by descending [`PluginConfig::priority`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Kernel-level plugins loaded before everything else.
    System,
    /// Shared infrastructure consumed by user plugins.
    Library,
    /// Application plugins; the default.
    #[default]
    User,
}

// =============================================================================
// Configuration & metadata
// =============================================================================

/// Per-plugin configuration supplied to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Unique plugin id; must match `[A-Za-z0-9_-]+`.
    pub id: String,
    /// Disabled plugins are skipped entirely during `initialize`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Functional category, drives load ordering across categories.
    #[serde(default, rename = "type")]
    pub plugin_type: PluginType,
    /// Load priority within a category; higher loads earlier.
    #[serde(default)]
    pub priority: u32,
    /// Ids of plugins that must initialize and start before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Opaque plugin-specific configuration section.
    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

impl PluginConfig {
    /// Creates a config with defaults for everything but the id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            plugin_type: PluginType::User,
            priority: 0,
            dependencies: Vec::new(),
            config: Value::Null,
        }
    }

    /// Adds a dependency edge.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Sets the plugin category.
    pub fn with_type(mut self, plugin_type: PluginType) -> Self {
        self.plugin_type = plugin_type;
        self
    }

    /// Sets the load priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Validates the id against `[A-Za-z0-9_-]+`.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("plugin id must not be empty".into());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!(
                "plugin id '{}' contains characters outside [A-Za-z0-9_-]",
                self.id
            ));
        }
        Ok(())
    }
}

/// Descriptive metadata attached to every plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Must equal the plugin's id.
    pub id: String,
    /// Human-readable name shown in logs and registries.
    pub name: String,
    /// Semver version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// One-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Declared dependency ids, advisory; the engine orders by
    /// [`PluginConfig::dependencies`].
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// =============================================================================
// Health
// =============================================================================

/// Coarse health classification reported by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Health snapshot returned by [`Plugin::health`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHealth {
    pub status: HealthStatus,
    pub healthy: bool,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PluginHealth {
    /// A healthy report stamped now.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            healthy: true,
            timestamp_ms: now_ms(),
            details: None,
        }
    }

    /// An unhealthy report stamped now.
    pub fn unhealthy(details: Value) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            healthy: false,
            timestamp_ms: now_ms(),
            details: Some(details),
        }
    }
}

// =============================================================================
// Plugin trait
// =============================================================================

/// Read-only view of the plugin registry handed to plugins during
/// initialization, so a plugin can reach the instances it depends on.
pub trait PluginLookup: Send + Sync {
    /// Returns the plugin registered under `id`, if any.
    fn get_plugin(&self, id: &str) -> Option<BoxedPlugin>;
}

/// The contract every extension unit implements.
///
/// All lifecycle methods may suspend. Implementations own their observable
/// state and advance it themselves after each successful call; use a
/// [`StateCell`] (or any interior-mutable holder) for the state field.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable unique id; must match the id in [`Plugin::metadata`].
    fn id(&self) -> &str;

    /// Current observable lifecycle state.
    fn state(&self) -> PluginState;

    /// Descriptive metadata.
    fn metadata(&self) -> PluginMetadata;

    /// Called once after loading, in dependency order.
    async fn initialize(
        &self,
        config: &PluginConfig,
        lookup: &dyn PluginLookup,
    ) -> EngineResult<()>;

    /// Called once in dependency order after all plugins initialized.
    async fn start(&self, services: &ServiceRegistry) -> EngineResult<()>;

    /// Called in reverse dependency order while the plugin is active.
    async fn stop(&self) -> EngineResult<()>;

    /// Best-effort teardown; must not fail.
    async fn cleanup(&self);

    /// Current health snapshot.
    fn health(&self) -> PluginHealth;
}

/// A shared plugin trait object.
pub type BoxedPlugin = Arc<dyn Plugin>;

/// Interior-mutable holder for a plugin's observable state.
///
/// Purely a convenience for implementors; the engine only sees
/// [`Plugin::state`].
#[derive(Debug)]
pub struct StateCell(parking_lot::Mutex<PluginState>);

impl StateCell {
    pub fn new(state: PluginState) -> Self {
        Self(parking_lot::Mutex::new(state))
    }

    pub fn get(&self) -> PluginState {
        *self.0.lock()
    }

    pub fn set(&self, state: PluginState) {
        *self.0.lock() = state;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(PluginState::Registered)
    }
}
