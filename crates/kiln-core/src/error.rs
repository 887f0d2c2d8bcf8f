//! Unified error types for the Kiln kernel.
//!
//! Every fallible operation across subsystem boundaries returns a `Result`
//! with one of these enums; user-code failures (plugin methods, listeners,
//! loaders) are caught at the boundary and wrapped, never re-thrown as
//! panics. Each engine error exposes a deterministic [`RecoveryHint`] so
//! callers can decide whether retrying is worthwhile.

use thiserror::Error;

use crate::plugin::{EngineState, PluginState};

// =============================================================================
// Event hub errors
// =============================================================================

/// Errors produced by the event hub (topics, queues, ports).
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// A bounded bus is at capacity.
    #[error("'{resource}' is full (capacity {capacity})")]
    ResourceUnavailable {
        /// Name of the topic or queue that rejected the message.
        resource: String,
        /// Configured maximum size.
        capacity: usize,
    },

    /// Unknown topic, queue, or subscription.
    #[error("{kind} '{name}' not found")]
    ResourceNotFound {
        /// What was looked up: `"topic"`, `"queue"`, `"subscription"`, `"port"`.
        kind: &'static str,
        /// The missing name or id.
        name: String,
    },

    /// Publishing or processing a message failed.
    #[error("event processing failed on '{channel}': {reason}")]
    EventProcessingFailed {
        /// Topic or queue name.
        channel: String,
        /// Reason for failure.
        reason: String,
    },

    /// Delivery to a subscriber failed after exhausting its retry budget.
    #[error("delivery to subscription '{subscription}' failed after {attempts} attempt(s): {reason}")]
    EventDeliveryFailed {
        /// Subscription id.
        subscription: String,
        /// Total listener invocations, including retries.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },

    /// A broker port could not be connected.
    #[error("broker port '{port}' connection failed: {reason}")]
    AdapterConnectionFailed { port: String, reason: String },

    /// A broker port could not be disconnected.
    #[error("broker port '{port}' disconnection failed: {reason}")]
    AdapterDisconnectionFailed { port: String, reason: String },

    /// An operation was attempted in the wrong state (e.g. publishing to a
    /// stopped topic, or starting a topic twice).
    #[error("'{name}' is {actual}, operation requires {expected}")]
    InvalidState {
        /// Topic, queue, or hub name.
        name: String,
        /// State the operation requires.
        expected: &'static str,
        /// State the resource was in.
        actual: &'static str,
    },
}

// =============================================================================
// Plugin engine errors
// =============================================================================

/// Errors produced by the plugin engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// No plugin registered under the given id.
    #[error("plugin '{id}' not found")]
    PluginNotFound { id: String },

    /// A loader failed, or no loader accepted the id.
    #[error("failed to load plugin '{id}': {reason}")]
    PluginLoadFailed { id: String, reason: String },

    /// The registry rejected the plugin.
    #[error("failed to register plugin '{id}': {reason}")]
    PluginRegistrationFailed { id: String, reason: String },

    /// The plugin's `initialize` returned an error.
    #[error("plugin '{id}' failed to initialize: {reason}")]
    PluginInitializationFailed { id: String, reason: String },

    /// The plugin's `start` returned an error.
    #[error("plugin '{id}' failed to start: {reason}")]
    PluginStartFailed { id: String, reason: String },

    /// The plugin's `stop` returned an error.
    #[error("plugin '{id}' failed to stop: {reason}")]
    PluginStopFailed { id: String, reason: String },

    /// Best-effort cleanup reported a failure.
    #[error("plugin '{id}' cleanup failed: {reason}")]
    PluginCleanupFailed { id: String, reason: String },

    /// A lifecycle operation was attempted against the wrong plugin state.
    #[error("plugin '{id}' cannot move {from} -> {to}")]
    InvalidStateTransition {
        id: String,
        from: PluginState,
        to: PluginState,
    },

    /// One or more declared dependencies are absent from the config set.
    /// Entries are formatted `"dependent -> missing"`.
    #[error("missing dependencies: {}", missing.join(", "))]
    MissingDependencies { missing: Vec<String> },

    /// The dependency graph contains a cycle.
    #[error("circular dependency involving: {}", involved.join(", "))]
    CircularDependency { involved: Vec<String> },

    /// A plugin config failed validation.
    #[error("invalid configuration for '{id}': {reason}")]
    InvalidConfiguration { id: String, reason: String },

    /// An operation that requires an initialized engine ran against a
    /// stopped one.
    #[error("engine is not initialized")]
    EngineNotInitialized,

    /// An engine phase was entered from the wrong state.
    #[error("engine cannot {operation} while {state}")]
    EngineInvalidState {
        operation: &'static str,
        state: EngineState,
    },
}

impl EngineError {
    /// The plugin id this error is about, when there is one.
    pub fn plugin_id(&self) -> Option<&str> {
        use EngineError::*;
        match self {
            PluginNotFound { id }
            | PluginLoadFailed { id, .. }
            | PluginRegistrationFailed { id, .. }
            | PluginInitializationFailed { id, .. }
            | PluginStartFailed { id, .. }
            | PluginStopFailed { id, .. }
            | PluginCleanupFailed { id, .. }
            | InvalidStateTransition { id, .. }
            | InvalidConfiguration { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Deterministic recovery guidance for this error code.
    pub fn recovery(&self) -> RecoveryHint {
        use EngineError::*;
        match self {
            PluginLoadFailed { .. } | PluginInitializationFailed { .. } => RecoveryHint {
                can_retry: true,
                retry_delay_ms: Some(1000),
                max_retries: Some(3),
                suggestions: vec![
                    "check the plugin's own logs for the underlying failure".into(),
                    "verify the plugin-specific config section".into(),
                ],
            },
            PluginStartFailed { .. } | PluginStopFailed { .. } => RecoveryHint {
                can_retry: true,
                retry_delay_ms: Some(1000),
                max_retries: Some(1),
                suggestions: vec!["inspect the plugin's health report".into()],
            },
            MissingDependencies { missing } => RecoveryHint {
                can_retry: false,
                retry_delay_ms: None,
                max_retries: None,
                suggestions: missing
                    .iter()
                    .map(|edge| format!("add a config for '{edge}' or drop the dependency"))
                    .collect(),
            },
            CircularDependency { .. } => RecoveryHint {
                can_retry: false,
                retry_delay_ms: None,
                max_retries: None,
                suggestions: vec!["break the cycle by removing one dependency edge".into()],
            },
            EngineNotInitialized | EngineInvalidState { .. } => RecoveryHint {
                can_retry: true,
                retry_delay_ms: None,
                max_retries: None,
                suggestions: vec!["drive the engine through initialize() first".into()],
            },
            _ => RecoveryHint {
                can_retry: false,
                retry_delay_ms: None,
                max_retries: None,
                suggestions: Vec::new(),
            },
        }
    }
}

/// Guidance attached to every [`EngineError`] code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryHint {
    /// Whether retrying the failed operation can succeed without
    /// configuration changes.
    pub can_retry: bool,
    /// Suggested delay before a retry.
    pub retry_delay_ms: Option<u64>,
    /// Suggested retry budget.
    pub max_retries: Option<u32>,
    /// Human-oriented remediation steps.
    pub suggestions: Vec<String>,
}

// =============================================================================
// Result type aliases
// =============================================================================

/// Result type for event hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Result type for plugin engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependencies_formats_edges() {
        let err = EngineError::MissingDependencies {
            missing: vec!["P1 -> P9".into()],
        };
        assert_eq!(err.to_string(), "missing dependencies: P1 -> P9");
        assert!(!err.recovery().can_retry);
    }

    #[test]
    fn plugin_id_extraction() {
        let err = EngineError::PluginStartFailed {
            id: "audit".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.plugin_id(), Some("audit"));
        assert!(err.recovery().can_retry);
        assert!(EngineError::EngineNotInitialized.plugin_id().is_none());
    }

    #[test]
    fn hub_errors_render_context() {
        let err = HubError::ResourceUnavailable {
            resource: "orders".into(),
            capacity: 2,
        };
        assert_eq!(err.to_string(), "'orders' is full (capacity 2)");
    }
}
