//! The application context binding the event hub and the plugin engine.
//!
//! [`ApplicationContext`] exclusively owns one [`EventHub`] and one
//! [`PluginEngine`] and drives both through a single phase machine:
//!
//! ```text
//! Uninitialized → ConfigurationLoading → PluginManagerSetup → Ready
//!       → Running → Stopped → ConfigurationLoading (re-init)
//!   any → Failed → ConfigurationLoading (recover)
//! ```
//!
//! At startup the hub comes up before the engine; shutdown reverses that.
//! Phase transitions serialize through a single in-progress flag; a
//! concurrent attempt is dropped with
//! [`ContextError::TransitionInProgress`] and logged.
//!
//! # Cross-subsystem bridge
//!
//! Plugin lifecycle notifications always propagate into the hub as events
//! typed `plugin:<phase>`; hub events whose type begins with `context:`
//! are forwarded to the engine-side handler. Bridged events carry an
//! `origin` metadata tag and the bridge drops events originating on the
//! destination side, so nothing can loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use kiln_core::event::Event;
use kiln_core::plugin::PluginConfig;
use kiln_engine::engine::{EngineStats, PluginEngine};
use kiln_engine::lifecycle::BatchReport;
use kiln_hub::hub::{EventHub, HubStats};
use kiln_hub::subscriber::{EventListener, SubscribeOptions};

use crate::error::{ContextError, ContextResult};
use crate::health::{ContextHealth, HealthEntry, Subsystem};

/// Application-level phase machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplicationPhase {
    #[default]
    Uninitialized,
    ConfigurationLoading,
    PluginManagerSetup,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl ApplicationPhase {
    fn as_str(self) -> &'static str {
        match self {
            ApplicationPhase::Uninitialized => "uninitialized",
            ApplicationPhase::ConfigurationLoading => "configuration-loading",
            ApplicationPhase::PluginManagerSetup => "plugin-manager-setup",
            ApplicationPhase::Ready => "ready",
            ApplicationPhase::Running => "running",
            ApplicationPhase::Stopped => "stopped",
            ApplicationPhase::Failed => "failed",
        }
    }

    /// Whether `self → next` is a legal phase transition. `Failed` is
    /// reachable from anywhere; recovery re-enters `ConfigurationLoading`.
    pub fn can_transition_to(self, next: ApplicationPhase) -> bool {
        use ApplicationPhase::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Uninitialized, ConfigurationLoading)
                | (ConfigurationLoading, PluginManagerSetup)
                | (PluginManagerSetup, Ready)
                | (Ready, Running)
                | (Running, Stopped)
                | (Stopped, ConfigurationLoading)
                | (Failed, ConfigurationLoading)
        )
    }
}

impl std::fmt::Display for ApplicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine-side consumer of bridged `context:*` events.
pub type ContextEventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Orchestrator composing the event hub and the plugin engine.
pub struct ApplicationContext {
    hub: Arc<EventHub>,
    engine: Arc<PluginEngine>,
    phase: Mutex<ApplicationPhase>,
    transition_in_progress: AtomicBool,
    health: ContextHealth,
    context_handler: Arc<Mutex<Option<ContextEventHandler>>>,
    bridge_subscription: Mutex<Option<String>>,
}

impl ApplicationContext {
    /// Builds a context around a pre-configured engine (loaders already
    /// added). The context installs its own lifecycle hook on the engine
    /// to feed the bridge; use the engine standalone if you need a custom
    /// hook instead.
    pub fn new(mut engine: PluginEngine) -> Arc<Self> {
        let hub = Arc::new(EventHub::new());

        let bridge_hub = Arc::clone(&hub);
        engine.set_lifecycle_hook(Arc::new(move |phase, plugin_id, error| {
            let event = Event::new(
                format!("plugin:{phase}"),
                json!({
                    "plugin": plugin_id,
                    "error": error.map(|e| e.to_string()),
                }),
            )
            .with_metadata("origin", json!("engine"));
            let hub = Arc::clone(&bridge_hub);
            tokio::spawn(async move {
                if let Err(error) = hub.emit(event).await {
                    debug!(error = %error, "Lifecycle event could not be emitted");
                }
            });
        }));

        let context = Arc::new(Self {
            hub,
            engine: Arc::new(engine),
            phase: Mutex::new(ApplicationPhase::Uninitialized),
            transition_in_progress: AtomicBool::new(false),
            health: ContextHealth::new(),
            context_handler: Arc::new(Mutex::new(None)),
            bridge_subscription: Mutex::new(None),
        });

        // Hub → engine side: forward context:* events, rejecting anything
        // that originated on the engine side.
        let handler_slot = Arc::clone(&context.context_handler);
        let subscription = context.hub.subscribe_all(
            EventListener::from_sync(move |event| {
                let from_engine =
                    event.metadata.get("origin").and_then(Value::as_str) == Some("engine");
                if event.event_type.starts_with("context:") && !from_engine {
                    match handler_slot.lock().clone() {
                        Some(handler) => handler(event),
                        None => {
                            debug!(event = %event.event_type, "No context event handler installed")
                        }
                    }
                }
                Ok(())
            }),
            SubscribeOptions::default(),
        );
        *context.bridge_subscription.lock() = Some(subscription);

        context
    }

    /// The owned event hub.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The owned plugin engine.
    pub fn engine(&self) -> &Arc<PluginEngine> {
        &self.engine
    }

    /// Current phase.
    pub fn phase(&self) -> ApplicationPhase {
        *self.phase.lock()
    }

    /// Health snapshot across `eventHub`, `pluginEngine`, `application`.
    pub fn health(&self) -> std::collections::HashMap<Subsystem, HealthEntry> {
        self.health.snapshot()
    }

    /// Installs the engine-side consumer for bridged `context:*` events.
    pub fn set_context_event_handler(&self, handler: ContextEventHandler) {
        *self.context_handler.lock() = Some(handler);
    }

    // ─── Phase operations ────────────────────────────────────────────────────

    /// Validates configs and initializes the plugin engine.
    pub async fn initialize(&self, configs: Vec<PluginConfig>) -> ContextResult<()> {
        let _guard = self.begin_transition()?;
        self.enter_phase(ApplicationPhase::ConfigurationLoading)?;
        self.run_initialize(configs).await
    }

    /// Re-initializes after a failure: tears down engine residue and walks
    /// `Failed → ConfigurationLoading → … → Ready` again.
    pub async fn recover(&self, configs: Vec<PluginConfig>) -> ContextResult<()> {
        let _guard = self.begin_transition()?;
        {
            let phase = self.phase.lock();
            if *phase != ApplicationPhase::Failed {
                return Err(ContextError::InvalidPhase {
                    expected: "failed",
                    actual: *phase,
                });
            }
        }
        self.engine.cleanup().await;
        self.enter_phase(ApplicationPhase::ConfigurationLoading)?;
        self.run_initialize(configs).await
    }

    async fn run_initialize(&self, configs: Vec<PluginConfig>) -> ContextResult<()> {
        for config in &configs {
            if let Err(reason) = config.validate() {
                let error = kiln_core::error::EngineError::InvalidConfiguration {
                    id: config.id.clone(),
                    reason,
                };
                self.fail(Subsystem::Application, error.to_string());
                return Err(error.into());
            }
        }

        self.enter_phase(ApplicationPhase::PluginManagerSetup)?;
        if let Err(error) = self.engine.initialize(configs).await {
            self.fail(Subsystem::PluginEngine, error.to_string());
            return Err(error.into());
        }

        self.enter_phase(ApplicationPhase::Ready)?;
        self.health.mark_healthy(Subsystem::EventHub);
        self.health.mark_healthy(Subsystem::PluginEngine);
        self.health.mark_healthy(Subsystem::Application);
        info!("Application context initialized");
        Ok(())
    }

    /// Starts the engine (the hub is live from construction and comes
    /// first by design). Individual plugin failures surface in the batch
    /// report and the health map, not as an error.
    pub async fn start(&self) -> ContextResult<BatchReport> {
        let _guard = self.begin_transition()?;
        {
            let phase = self.phase.lock();
            if *phase != ApplicationPhase::Ready {
                return Err(ContextError::InvalidPhase {
                    expected: "ready",
                    actual: *phase,
                });
            }
        }
        self.health.mark_healthy(Subsystem::EventHub);

        let batch = match self.engine.start().await {
            Ok(batch) => batch,
            Err(error) => {
                self.fail(Subsystem::PluginEngine, error.to_string());
                return Err(error.into());
            }
        };
        for result in &batch.results {
            if let Some(error) = &result.error {
                self.health
                    .record_error(Subsystem::PluginEngine, error.to_string());
            }
        }

        self.enter_phase(ApplicationPhase::Running)?;
        self.health.mark_healthy(Subsystem::Application);
        info!(
            started = batch.succeeded,
            failed = batch.failed,
            "Application context running"
        );
        Ok(batch)
    }

    /// Stops everything: engine (stop + cleanup) first, hub channels
    /// after, the reverse of startup. Best-effort throughout; failures
    /// land in the health map.
    pub async fn stop(&self) -> ContextResult<()> {
        let _guard = self.begin_transition()?;
        {
            let phase = self.phase.lock();
            if *phase != ApplicationPhase::Running {
                return Err(ContextError::InvalidPhase {
                    expected: "running",
                    actual: *phase,
                });
            }
        }

        match self.engine.stop().await {
            Ok(batch) => {
                for result in &batch.results {
                    if let Some(error) = &result.error {
                        self.health
                            .record_error(Subsystem::PluginEngine, error.to_string());
                    }
                }
            }
            Err(error) => {
                warn!(error = %error, "Engine stop failed; continuing shutdown");
                self.health
                    .record_error(Subsystem::PluginEngine, error.to_string());
            }
        }
        self.engine.cleanup().await;

        let (topics, queues) = self.hub.stop_all().await;
        for (name, error) in topics.failures.iter().chain(queues.failures.iter()) {
            self.health
                .record_error(Subsystem::EventHub, format!("{name}: {error}"));
        }

        self.enter_phase(ApplicationPhase::Stopped)?;
        info!("Application context stopped");
        Ok(())
    }

    /// Initializes, starts, and runs until `shutdown` resolves, then
    /// stops.
    pub async fn run_until<F>(&self, configs: Vec<PluginConfig>, shutdown: F) -> ContextResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.initialize(configs).await?;
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Runs until Ctrl+C (or SIGTERM on unix).
    pub async fn run(&self, configs: Vec<PluginConfig>) -> ContextResult<()> {
        self.run_until(configs, wait_for_shutdown()).await
    }

    /// Point-in-time summary across both subsystems.
    pub async fn stats(&self) -> ContextStats {
        ContextStats {
            phase: self.phase(),
            hub: self.hub.stats().await,
            engine: self.engine.stats(),
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn begin_transition(&self) -> ContextResult<TransitionGuard<'_>> {
        if self.transition_in_progress.swap(true, Ordering::AcqRel) {
            warn!("Concurrent phase transition attempt dropped");
            return Err(ContextError::TransitionInProgress);
        }
        Ok(TransitionGuard(&self.transition_in_progress))
    }

    fn enter_phase(&self, next: ApplicationPhase) -> ContextResult<()> {
        let mut phase = self.phase.lock();
        if !phase.can_transition_to(next) {
            return Err(ContextError::InvalidPhase {
                expected: next.as_str(),
                actual: *phase,
            });
        }
        debug!(from = %*phase, to = %next, "Phase transition");
        *phase = next;
        Ok(())
    }

    fn fail(&self, subsystem: Subsystem, error: String) {
        *self.phase.lock() = ApplicationPhase::Failed;
        self.health.record_error(subsystem, error.clone());
        self.health.record_error(Subsystem::Application, error);
    }
}

struct TransitionGuard<'a>(&'a AtomicBool);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down");
    }
}

/// Summary statistics for the context.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub phase: ApplicationPhase,
    pub hub: HubStats,
    pub engine: EngineStats,
}

impl std::fmt::Display for ContextStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context: {} | {} | {}", self.phase, self.engine, self.hub)
    }
}
