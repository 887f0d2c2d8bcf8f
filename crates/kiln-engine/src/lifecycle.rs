//! Guarded state-transition driver for individual plugins.
//!
//! Each operation checks the plugin's current state against its
//! precondition before invoking anything: `initialize` and `start` require
//! `Loaded`, `stop` requires `Active`, `cleanup` is always permitted. A
//! violation produces an [`EngineError::InvalidStateTransition`] report
//! without touching the plugin.
//!
//! Plugin calls are timed, panic-caught, and their failures routed through
//! an optional failure hook which itself can never take the manager down.
//! Plugins advance their own observable state; a plugin that reports an
//! unexpected state after a successful call gets a warning, not a failure.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, warn};

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::plugin::{BoxedPlugin, PluginConfig, PluginLookup, PluginState};
use kiln_core::service::ServiceRegistry;

/// The four guarded operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Initialize,
    Start,
    Stop,
    Cleanup,
}

impl LifecycleOp {
    /// State the plugin must be in before the call; `None` = always allowed.
    fn precondition(self) -> Option<PluginState> {
        match self {
            LifecycleOp::Initialize | LifecycleOp::Start => Some(PluginState::Loaded),
            LifecycleOp::Stop => Some(PluginState::Active),
            LifecycleOp::Cleanup => None,
        }
    }

    /// State a well-behaved plugin reports after a successful call.
    fn expected_next(self) -> PluginState {
        match self {
            LifecycleOp::Initialize => PluginState::Loaded,
            LifecycleOp::Start => PluginState::Active,
            LifecycleOp::Stop => PluginState::Suspended,
            LifecycleOp::Cleanup => PluginState::Unloaded,
        }
    }

    fn wrap_failure(self, id: &str, reason: String) -> EngineError {
        let id = id.to_string();
        match self {
            LifecycleOp::Initialize => EngineError::PluginInitializationFailed { id, reason },
            LifecycleOp::Start => EngineError::PluginStartFailed { id, reason },
            LifecycleOp::Stop => EngineError::PluginStopFailed { id, reason },
            LifecycleOp::Cleanup => EngineError::PluginCleanupFailed { id, reason },
        }
    }
}

impl std::fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleOp::Initialize => "initialize",
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Cleanup => "cleanup",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one guarded operation on one plugin.
#[derive(Debug, Clone)]
pub struct TransitionReport {
    pub plugin_id: String,
    pub operation: LifecycleOp,
    pub success: bool,
    pub previous_state: PluginState,
    /// The plugin's observable state after the call.
    pub new_state: PluginState,
    pub duration: Duration,
    pub error: Option<EngineError>,
}

/// Aggregate of a sequential batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<TransitionReport>,
    pub duration: Duration,
}

impl BatchReport {
    pub(crate) fn push(&mut self, report: TransitionReport) {
        self.total += 1;
        if report.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(report);
    }
}

/// Callback receiving every per-plugin failure as it happens.
pub type FailureHook = Arc<dyn Fn(&str, &EngineError) + Send + Sync>;

/// Drives guarded lifecycle calls into plugins.
#[derive(Default)]
pub struct LifecycleManager {
    failure_hook: Option<FailureHook>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the failure hook. Panics inside the hook are caught and
    /// logged so the hook can never derail a batch.
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.failure_hook = Some(hook);
        self
    }

    // ─── Single-plugin operations ────────────────────────────────────────────

    pub async fn initialize(
        &self,
        plugin: &BoxedPlugin,
        config: &PluginConfig,
        lookup: &dyn PluginLookup,
    ) -> TransitionReport {
        let op = LifecycleOp::Initialize;
        let previous = plugin.state();
        if let Some(report) = self.guard(plugin, op, previous) {
            return report;
        }
        let started = Instant::now();
        let outcome = AssertUnwindSafe(plugin.initialize(config, lookup))
            .catch_unwind()
            .await;
        self.finish(plugin, op, previous, started, flatten(op, plugin.id(), outcome))
    }

    pub async fn start(
        &self,
        plugin: &BoxedPlugin,
        services: &ServiceRegistry,
    ) -> TransitionReport {
        let op = LifecycleOp::Start;
        let previous = plugin.state();
        if let Some(report) = self.guard(plugin, op, previous) {
            return report;
        }
        let started = Instant::now();
        let outcome = AssertUnwindSafe(plugin.start(services)).catch_unwind().await;
        self.finish(plugin, op, previous, started, flatten(op, plugin.id(), outcome))
    }

    pub async fn stop(&self, plugin: &BoxedPlugin) -> TransitionReport {
        let op = LifecycleOp::Stop;
        let previous = plugin.state();
        if let Some(report) = self.guard(plugin, op, previous) {
            return report;
        }
        let started = Instant::now();
        let outcome = AssertUnwindSafe(plugin.stop()).catch_unwind().await;
        self.finish(plugin, op, previous, started, flatten(op, plugin.id(), outcome))
    }

    /// Always permitted; a panicking cleanup is reported, never propagated.
    pub async fn cleanup(&self, plugin: &BoxedPlugin) -> TransitionReport {
        let op = LifecycleOp::Cleanup;
        let previous = plugin.state();
        let started = Instant::now();
        let outcome: Result<EngineResult<()>, _> =
            AssertUnwindSafe(plugin.cleanup()).catch_unwind().await.map(Ok);
        self.finish(plugin, op, previous, started, flatten(op, plugin.id(), outcome))
    }

    // ─── Batch operations (sequential, order given by the caller) ────────────

    pub async fn initialize_all(
        &self,
        items: &[(BoxedPlugin, PluginConfig)],
        lookup: &dyn PluginLookup,
    ) -> BatchReport {
        let started = Instant::now();
        let mut batch = BatchReport::default();
        for (plugin, config) in items {
            batch.push(self.initialize(plugin, config, lookup).await);
        }
        batch.duration = started.elapsed();
        batch
    }

    pub async fn start_all(
        &self,
        plugins: &[BoxedPlugin],
        services: &ServiceRegistry,
    ) -> BatchReport {
        let started = Instant::now();
        let mut batch = BatchReport::default();
        for plugin in plugins {
            batch.push(self.start(plugin, services).await);
        }
        batch.duration = started.elapsed();
        batch
    }

    pub async fn stop_all(&self, plugins: &[BoxedPlugin]) -> BatchReport {
        let started = Instant::now();
        let mut batch = BatchReport::default();
        for plugin in plugins {
            batch.push(self.stop(plugin).await);
        }
        batch.duration = started.elapsed();
        batch
    }

    /// Best-effort: every plugin's cleanup runs regardless of earlier
    /// failures in the batch.
    pub async fn cleanup_all(&self, plugins: &[BoxedPlugin]) -> BatchReport {
        let started = Instant::now();
        let mut batch = BatchReport::default();
        for plugin in plugins {
            batch.push(self.cleanup(plugin).await);
        }
        batch.duration = started.elapsed();
        batch
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn guard(
        &self,
        plugin: &BoxedPlugin,
        op: LifecycleOp,
        current: PluginState,
    ) -> Option<TransitionReport> {
        let required = op.precondition()?;
        if current == required {
            return None;
        }
        let error = EngineError::InvalidStateTransition {
            id: plugin.id().to_string(),
            from: current,
            to: op.expected_next(),
        };
        self.fire_hook(plugin.id(), &error);
        Some(TransitionReport {
            plugin_id: plugin.id().to_string(),
            operation: op,
            success: false,
            previous_state: current,
            new_state: current,
            duration: Duration::ZERO,
            error: Some(error),
        })
    }

    fn finish(
        &self,
        plugin: &BoxedPlugin,
        op: LifecycleOp,
        previous: PluginState,
        started: Instant,
        result: EngineResult<()>,
    ) -> TransitionReport {
        let duration = started.elapsed();
        let new_state = plugin.state();
        match result {
            Ok(()) => {
                if new_state != op.expected_next() {
                    warn!(
                        plugin = %plugin.id(),
                        operation = %op,
                        state = %new_state,
                        expected = %op.expected_next(),
                        "Plugin did not advance its state after a successful call"
                    );
                }
                debug!(plugin = %plugin.id(), operation = %op, ?duration, "Lifecycle call succeeded");
                TransitionReport {
                    plugin_id: plugin.id().to_string(),
                    operation: op,
                    success: true,
                    previous_state: previous,
                    new_state,
                    duration,
                    error: None,
                }
            }
            Err(error) => {
                self.fire_hook(plugin.id(), &error);
                TransitionReport {
                    plugin_id: plugin.id().to_string(),
                    operation: op,
                    success: false,
                    previous_state: previous,
                    new_state,
                    duration,
                    error: Some(error),
                }
            }
        }
    }

    fn fire_hook(&self, plugin_id: &str, error: &EngineError) {
        if let Some(hook) = &self.failure_hook {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| hook(plugin_id, error)));
            if call.is_err() {
                warn!(plugin = %plugin_id, "Lifecycle failure hook panicked; ignoring");
            }
        }
    }
}

/// Collapses a caught-panic layer into the operation's failure code.
fn flatten(
    op: LifecycleOp,
    id: &str,
    outcome: Result<EngineResult<()>, Box<dyn std::any::Any + Send>>,
) -> EngineResult<()> {
    match outcome {
        Ok(result) => result.map_err(|error| match error {
            // Already one of the op's failure codes or a richer error from
            // the plugin; keep it.
            err @ EngineError::PluginInitializationFailed { .. }
            | err @ EngineError::PluginStartFailed { .. }
            | err @ EngineError::PluginStopFailed { .. }
            | err @ EngineError::PluginCleanupFailed { .. } => err,
            other => op.wrap_failure(id, other.to_string()),
        }),
        Err(_) => Err(op.wrap_failure(id, "plugin method panicked".into())),
    }
}
