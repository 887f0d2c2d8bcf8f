//! The batch driver across all plugins.
//!
//! One external entry per phase: `initialize(configs)` → `start()` →
//! `stop()` → `cleanup()`, guarded by the [`EngineState`] machine
//! (`Stopped → Initializing → Running → Stopping → Stopped`, with cleanup
//! forcing `Stopped` from anywhere).
//!
//! `initialize` is transactional in spirit: the first failing load or
//! plugin initialization aborts it, drops the engine back to `Stopped`,
//! and leaves the failed plugin registered in `Failed` state for a later
//! `cleanup`. `start`, `stop`, and `cleanup` are best-effort batches:
//! individual failures are reported through the lifecycle hook and
//! accumulated, never aborting the remaining plugins.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::loader::BoxedLoader;
use kiln_core::plugin::{EngineState, PluginConfig, PluginHealth, PluginState};
use kiln_core::service::ServiceRegistry;

use crate::lifecycle::{BatchReport, LifecycleManager, TransitionReport};
use crate::registry::{PluginRecord, PluginRegistry};
use crate::resolver::DependencyResolver;

/// Where in the lifecycle a hook notification comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Per-plugin: a loader is about to run / failed.
    Load,
    /// Per-plugin initialize.
    Initialize,
    /// Per-plugin start.
    Start,
    /// Per-plugin stop.
    Stop,
    /// Per-plugin cleanup.
    Cleanup,
    /// Engine-level phase boundaries.
    EngineInitialize,
    EngineStart,
    EngineStop,
    EngineCleanup,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookPhase::Load => "load",
            HookPhase::Initialize => "initialize",
            HookPhase::Start => "start",
            HookPhase::Stop => "stop",
            HookPhase::Cleanup => "cleanup",
            HookPhase::EngineInitialize => "engine-initialize",
            HookPhase::EngineStart => "engine-start",
            HookPhase::EngineStop => "engine-stop",
            HookPhase::EngineCleanup => "engine-cleanup",
        };
        write!(f, "{name}")
    }
}

/// Caller-provided callback invoked around every phase, per plugin and
/// engine-level. Receives the phase, the plugin id (absent for
/// engine-level notifications), and the error when the phase failed.
pub type LifecycleHook = Arc<dyn Fn(HookPhase, Option<&str>, Option<&EngineError>) + Send + Sync>;

/// Composes the registry, resolver, loaders, and lifecycle manager into
/// the load → init → start → stop → cleanup flow.
pub struct PluginEngine {
    state: Mutex<EngineState>,
    registry: Arc<PluginRegistry>,
    lifecycle: LifecycleManager,
    loaders: Vec<BoxedLoader>,
    services: Arc<ServiceRegistry>,
    startup_order: Mutex<Vec<String>>,
    hook: Option<LifecycleHook>,
}

impl PluginEngine {
    /// Creates an engine sharing `services` with its plugins. Loaders are
    /// supplied via [`PluginEngine::add_loader`] before the first
    /// `initialize`.
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            state: Mutex::new(EngineState::Stopped),
            registry: Arc::new(PluginRegistry::new()),
            lifecycle: LifecycleManager::new(),
            loaders: Vec::new(),
            services,
            startup_order: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Appends a loader strategy; strategies are consulted in insertion
    /// order and the first `can_load` wins.
    pub fn add_loader(&mut self, loader: BoxedLoader) {
        self.loaders.push(loader);
    }

    /// Installs the lifecycle hook. Panics inside the hook are caught and
    /// logged so a hook can never derail the engine.
    pub fn set_lifecycle_hook(&mut self, hook: LifecycleHook) {
        self.hook = Some(hook);
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// The resolved startup order of the current initialization, empty
    /// before `initialize` and after `cleanup`.
    pub fn startup_order(&self) -> Vec<String> {
        self.startup_order.lock().clone()
    }

    /// Observed state of every registered plugin.
    pub fn plugin_states(&self) -> HashMap<String, PluginState> {
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.registry
                    .plugin(&id)
                    .map(|plugin| (id, plugin.state()))
            })
            .collect()
    }

    /// Health sweep across every registered plugin.
    pub fn health_report(&self) -> HashMap<String, PluginHealth> {
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.registry
                    .plugin(&id)
                    .map(|plugin| (id, plugin.health()))
            })
            .collect()
    }

    /// Point-in-time summary.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            plugins: self.registry.len(),
            active: self.registry.ids_in_state(PluginState::Active).len(),
            failed: self.registry.ids_in_state(PluginState::Failed).len(),
        }
    }

    // ─── initialize ──────────────────────────────────────────────────────────

    /// Loads, registers, orders, and initializes every enabled config.
    ///
    /// Aborts on the first failure, returning the engine to `Stopped`;
    /// already-loaded plugins stay registered (the failed one in `Failed`
    /// state) until [`PluginEngine::cleanup`].
    pub async fn initialize(&self, configs: Vec<PluginConfig>) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Stopped {
                return Err(EngineError::EngineInvalidState {
                    operation: "initialize",
                    state: *state,
                });
            }
            *state = EngineState::Initializing;
        }
        self.fire_hook(HookPhase::EngineInitialize, None, None);

        match self.run_initialize(configs).await {
            Ok(()) => {
                info!(plugins = self.registry.len(), "Engine initialized");
                Ok(())
            }
            Err(error) => {
                error!(error = %error, "Engine initialization failed");
                self.fire_hook(HookPhase::EngineInitialize, None, Some(&error));
                *self.state.lock() = EngineState::Stopped;
                Err(error)
            }
        }
    }

    async fn run_initialize(&self, configs: Vec<PluginConfig>) -> EngineResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for config in &configs {
            config
                .validate()
                .map_err(|reason| EngineError::InvalidConfiguration {
                    id: config.id.clone(),
                    reason,
                })?;
            if !seen.insert(config.id.as_str()) {
                return Err(EngineError::InvalidConfiguration {
                    id: config.id.clone(),
                    reason: "duplicate plugin id".into(),
                });
            }
        }

        let enabled: Vec<PluginConfig> = configs
            .into_iter()
            .filter(|config| {
                if !config.enabled {
                    debug!(plugin = %config.id, "Plugin disabled, skipping");
                }
                config.enabled
            })
            .collect();

        // Load and register every enabled plugin.
        for config in &enabled {
            self.fire_hook(HookPhase::Load, Some(&config.id), None);
            match self.load_one(config).await {
                Ok(record) => self.registry.register(record)?,
                Err(error) => {
                    self.fire_hook(HookPhase::Load, Some(&config.id), Some(&error));
                    return Err(error);
                }
            }
        }

        // Resolve the startup order across the enabled set.
        let plan = DependencyResolver::resolve(&enabled)?;
        *self.startup_order.lock() = plan.startup_order.clone();

        // Initialize in dependency order; first failure aborts.
        for id in &plan.startup_order {
            let record = self
                .registry
                .get(id)
                .ok_or_else(|| EngineError::PluginNotFound { id: id.clone() })?;
            self.fire_hook(HookPhase::Initialize, Some(id), None);
            let report = self
                .lifecycle
                .initialize(&record.plugin, &record.config, self.registry.as_ref())
                .await;
            if !report.success {
                let error = report_error(&report);
                self.mark_failed(id);
                self.fire_hook(HookPhase::Initialize, Some(id), Some(&error));
                return Err(error);
            }
        }
        Ok(())
    }

    async fn load_one(&self, config: &PluginConfig) -> EngineResult<PluginRecord> {
        let loader = self
            .loaders
            .iter()
            .find(|loader| loader.can_load(&config.id, config))
            .ok_or_else(|| EngineError::PluginLoadFailed {
                id: config.id.clone(),
                reason: "no loader accepted the id".into(),
            })?;
        debug!(plugin = %config.id, loader = %loader.name(), "Loading plugin");

        let plugin = loader.load(&config.id, config).await.map_err(|cause| {
            match cause {
                err @ EngineError::PluginLoadFailed { .. } => err,
                other => EngineError::PluginLoadFailed {
                    id: config.id.clone(),
                    reason: format!("loader '{}' failed: {other}", loader.name()),
                },
            }
        })?;
        Ok(PluginRecord::new(plugin, config.clone()))
    }

    // ─── start ───────────────────────────────────────────────────────────────

    /// Starts plugins in startup order against the shared service registry.
    ///
    /// Individual failures mark the plugin `Failed`, notify the hook, and
    /// the batch continues; the engine ends up `Running` regardless.
    pub async fn start(&self) -> EngineResult<BatchReport> {
        {
            let state = self.state.lock();
            match *state {
                EngineState::Initializing => {}
                EngineState::Stopped => return Err(EngineError::EngineNotInitialized),
                other => {
                    return Err(EngineError::EngineInvalidState {
                        operation: "start",
                        state: other,
                    });
                }
            }
        }
        self.fire_hook(HookPhase::EngineStart, None, None);

        let order = self.startup_order();
        let mut batch = BatchReport::default();
        let started = std::time::Instant::now();
        for id in &order {
            let Some(record) = self.registry.get(id) else {
                continue;
            };
            self.fire_hook(HookPhase::Start, Some(id), None);
            let report = self.lifecycle.start(&record.plugin, &self.services).await;
            if report.success {
                let _ = self
                    .registry
                    .update_state(id, PluginState::Loaded, PluginState::Active);
                info!(plugin = %id, "Plugin started");
            } else {
                let error = report_error(&report);
                warn!(plugin = %id, error = %error, "Plugin failed to start; continuing");
                self.mark_failed(id);
                self.fire_hook(HookPhase::Start, Some(id), Some(&error));
            }
            batch.push(report);
        }
        batch.duration = started.elapsed();

        *self.state.lock() = EngineState::Running;
        info!(
            started = batch.succeeded,
            failed = batch.failed,
            "Engine running"
        );
        Ok(batch)
    }

    // ─── stop ────────────────────────────────────────────────────────────────

    /// Stops currently-active plugins in reverse startup order.
    pub async fn stop(&self) -> EngineResult<BatchReport> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Running {
                return Err(EngineError::EngineInvalidState {
                    operation: "stop",
                    state: *state,
                });
            }
            *state = EngineState::Stopping;
        }
        self.fire_hook(HookPhase::EngineStop, None, None);

        let mut order = self.startup_order();
        order.reverse();

        let mut batch = BatchReport::default();
        let started = std::time::Instant::now();
        for id in &order {
            let Some(record) = self.registry.get(id) else {
                continue;
            };
            if record.plugin.state() != PluginState::Active {
                debug!(plugin = %id, state = %record.plugin.state(), "Not active, skipping stop");
                continue;
            }
            self.fire_hook(HookPhase::Stop, Some(id), None);
            let report = self.lifecycle.stop(&record.plugin).await;
            if report.success {
                let _ = self
                    .registry
                    .update_state(id, PluginState::Active, PluginState::Suspended);
                info!(plugin = %id, "Plugin stopped");
            } else {
                let error = report_error(&report);
                warn!(plugin = %id, error = %error, "Plugin failed to stop; continuing");
                self.mark_failed(id);
                self.fire_hook(HookPhase::Stop, Some(id), Some(&error));
            }
            batch.push(report);
        }
        batch.duration = started.elapsed();

        *self.state.lock() = EngineState::Stopped;
        info!(
            stopped = batch.succeeded,
            failed = batch.failed,
            "Engine stopped"
        );
        Ok(batch)
    }

    // ─── cleanup ─────────────────────────────────────────────────────────────

    /// Tears down every registered plugin in reverse startup order, then
    /// clears the registry and returns the engine to `Stopped`.
    ///
    /// Always safe to call, from any state, any number of times.
    pub async fn cleanup(&self) -> BatchReport {
        self.fire_hook(HookPhase::EngineCleanup, None, None);

        // Reverse startup order first, then anything registered outside the
        // order (e.g. loaded before a resolve failure).
        let mut order = self.startup_order();
        order.reverse();
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut stragglers: Vec<String> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| !ordered.contains(id.as_str()))
            .collect();
        stragglers.sort();
        order.extend(stragglers);

        let mut batch = BatchReport::default();
        let started = std::time::Instant::now();
        for id in &order {
            let Some(record) = self.registry.get(id) else {
                continue;
            };
            self.fire_hook(HookPhase::Cleanup, Some(id), None);
            let report = self.lifecycle.cleanup(&record.plugin).await;
            if !report.success {
                let error = report_error(&report);
                warn!(plugin = %id, error = %error, "Plugin cleanup failed; continuing");
                self.fire_hook(HookPhase::Cleanup, Some(id), Some(&error));
            }
            batch.push(report);
        }
        batch.duration = started.elapsed();

        self.registry.clear();
        self.startup_order.lock().clear();
        *self.state.lock() = EngineState::Stopped;
        info!(cleaned = batch.total, "Engine cleaned up");
        batch
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn mark_failed(&self, id: &str) {
        let old = self
            .registry
            .tracked_state(id)
            .unwrap_or(PluginState::Loaded);
        let _ = self.registry.update_state(id, old, PluginState::Failed);
    }

    fn fire_hook(&self, phase: HookPhase, plugin_id: Option<&str>, error: Option<&EngineError>) {
        if let Some(hook) = &self.hook {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                hook(phase, plugin_id, error)
            }));
            if call.is_err() {
                warn!(phase = %phase, plugin = ?plugin_id, "Lifecycle hook panicked; ignoring");
            }
        }
    }
}

fn report_error(report: &TransitionReport) -> EngineError {
    report.error.clone().unwrap_or_else(|| {
        EngineError::PluginNotFound {
            id: report.plugin_id.clone(),
        }
    })
}

/// Summary statistics for the engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub state: EngineState,
    pub plugins: usize,
    pub active: usize,
    pub failed: usize,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine: {}, {} plugin(s) ({} active, {} failed)",
            self.state, self.plugins, self.active, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::runtime::RuntimeLoader;
    use crate::testkit::TestPlugin;
    use parking_lot::Mutex as SyncMutex;

    fn engine_with(
        plugins: Vec<(&str, Arc<TestPlugin>)>,
    ) -> (PluginEngine, Arc<RuntimeLoader>) {
        let loader = Arc::new(RuntimeLoader::default());
        for (id, plugin) in plugins {
            loader.register_instance(id, plugin).unwrap();
        }
        let mut engine = PluginEngine::new(Arc::new(ServiceRegistry::new()));
        engine.add_loader(loader.clone());
        (engine, loader)
    }

    fn configs(specs: &[(&str, &[&str])]) -> Vec<PluginConfig> {
        specs
            .iter()
            .map(|(id, deps)| {
                let mut config = PluginConfig::new(*id);
                config.dependencies = deps.iter().map(|d| d.to_string()).collect();
                config
            })
            .collect()
    }

    #[tokio::test]
    async fn full_lifecycle_in_dependency_order() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let (engine, _) = engine_with(vec![
            ("P1", TestPlugin::new("P1").with_log(Arc::clone(&log)).build()),
            ("P2", TestPlugin::new("P2").with_log(Arc::clone(&log)).build()),
            ("P3", TestPlugin::new("P3").with_log(Arc::clone(&log)).build()),
        ]);

        engine
            .initialize(configs(&[
                ("P3", &["P1", "P2"]),
                ("P1", &[]),
                ("P2", &["P1"]),
            ]))
            .await
            .unwrap();
        assert_eq!(engine.startup_order(), ["P1", "P2", "P3"]);
        assert_eq!(engine.state(), EngineState::Initializing);

        let batch = engine.start().await.unwrap();
        assert_eq!(batch.succeeded, 3);
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.cleanup().await;
        assert!(engine.registry().is_empty());

        let calls: Vec<String> = log.lock().clone();
        assert_eq!(
            calls,
            [
                "initialize:P1",
                "initialize:P2",
                "initialize:P3",
                "start:P1",
                "start:P2",
                "start:P3",
                "stop:P3",
                "stop:P2",
                "stop:P1",
                "cleanup:P3",
                "cleanup:P2",
                "cleanup:P1",
            ]
        );
    }

    #[tokio::test]
    async fn cycle_aborts_initialize_back_to_stopped() {
        let (engine, _) = engine_with(vec![
            ("P1", TestPlugin::new("P1").build()),
            ("P2", TestPlugin::new("P2").build()),
        ]);

        let err = engine
            .initialize(configs(&[("P1", &["P2"]), ("P2", &["P1"])]))
            .await
            .unwrap_err();
        match err {
            EngineError::CircularDependency { involved } => {
                assert_eq!(involved, ["P1", "P2"]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn missing_dependency_is_reported() {
        let (engine, _) = engine_with(vec![("P1", TestPlugin::new("P1").build())]);

        let err = engine
            .initialize(configs(&[("P1", &["P9"])]))
            .await
            .unwrap_err();
        match err {
            EngineError::MissingDependencies { missing } => {
                assert_eq!(missing, ["P1 -> P9"]);
            }
            other => panic!("expected MissingDependencies, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_is_best_effort_and_reports_through_hook() {
        let failures = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&failures);

        let (mut engine, _) = engine_with(vec![
            ("P1", TestPlugin::new("P1").fail_start().build()),
            ("P2", TestPlugin::new("P2").build()),
        ]);
        engine.set_lifecycle_hook(Arc::new(move |phase, id, error| {
            if let Some(error) = error {
                sink.lock()
                    .push((phase, id.unwrap_or("").to_string(), error.to_string()));
            }
        }));

        engine
            .initialize(configs(&[("P1", &[]), ("P2", &[])]))
            .await
            .unwrap();
        let batch = engine.start().await.unwrap();

        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 1);
        let states = engine.plugin_states();
        assert_eq!(states["P1"], PluginState::Failed);
        assert_eq!(states["P2"], PluginState::Active);

        let seen = failures.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, HookPhase::Start);
        assert_eq!(seen[0].1, "P1");
    }

    #[tokio::test]
    async fn initialize_aborts_on_first_plugin_failure() {
        let (engine, _) = engine_with(vec![
            ("P1", TestPlugin::new("P1").build()),
            ("P2", TestPlugin::new("P2").fail_initialize().build()),
            ("P3", TestPlugin::new("P3").build()),
        ]);

        let err = engine
            .initialize(configs(&[("P1", &[]), ("P2", &["P1"]), ("P3", &["P2"])]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::PluginInitializationFailed { .. }
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        // The failed plugin stays registered in Failed state until cleanup.
        assert_eq!(
            engine.registry().tracked_state("P2"),
            Some(PluginState::Failed)
        );

        engine.cleanup().await;
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (engine, _) = engine_with(vec![("P1", TestPlugin::new("P1").build())]);
        engine.initialize(configs(&[("P1", &[])])).await.unwrap();

        engine.cleanup().await;
        let again = engine.cleanup().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.registry().is_empty());
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn no_loader_accepting_an_id_fails_the_load() {
        let (engine, _) = engine_with(vec![]);
        let err = engine
            .initialize(configs(&[("ghost", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PluginLoadFailed { .. }));
    }

    #[tokio::test]
    async fn disabled_configs_are_skipped() {
        let (engine, _) = engine_with(vec![("P1", TestPlugin::new("P1").build())]);
        let mut disabled = PluginConfig::new("absent");
        disabled.enabled = false;

        engine
            .initialize(vec![PluginConfig::new("P1"), disabled])
            .await
            .unwrap();
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.startup_order(), ["P1"]);
    }

    #[tokio::test]
    async fn phase_guards_reject_out_of_order_calls() {
        let (engine, _) = engine_with(vec![("P1", TestPlugin::new("P1").build())]);

        assert!(matches!(
            engine.start().await,
            Err(EngineError::EngineNotInitialized)
        ));
        assert!(matches!(
            engine.stop().await,
            Err(EngineError::EngineInvalidState { .. })
        ));

        engine.initialize(configs(&[("P1", &[])])).await.unwrap();
        assert!(matches!(
            engine.initialize(configs(&[("P1", &[])])).await,
            Err(EngineError::EngineInvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn a_panicking_hook_cannot_derail_the_engine() {
        let (mut engine, _) = engine_with(vec![("P1", TestPlugin::new("P1").build())]);
        engine.set_lifecycle_hook(Arc::new(|_, _, _| panic!("noisy hook")));

        engine.initialize(configs(&[("P1", &[])])).await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[tokio::test]
    async fn invalid_config_ids_are_rejected() {
        let (engine, _) = engine_with(vec![]);
        let err = engine
            .initialize(vec![PluginConfig::new("bad id")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));

        let err = engine
            .initialize(vec![PluginConfig::new("dup"), PluginConfig::new("dup")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn stats_and_health_cover_registered_plugins() {
        let (engine, _) = engine_with(vec![
            ("P1", TestPlugin::new("P1").build()),
            ("P2", TestPlugin::new("P2").build()),
        ]);
        engine
            .initialize(configs(&[("P1", &[]), ("P2", &[])]))
            .await
            .unwrap();
        engine.start().await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.plugins, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.failed, 0);

        let health = engine.health_report();
        assert!(health.values().all(|h| h.healthy));
    }
}
