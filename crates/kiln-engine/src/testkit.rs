//! Shared plugin doubles for the engine's unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::plugin::{
    BoxedPlugin, Plugin, PluginConfig, PluginHealth, PluginLookup, PluginMetadata, PluginState,
    StateCell,
};
use kiln_core::service::ServiceRegistry;

/// Configurable plugin double.
///
/// Starts in `Loaded` (the post-load convention loaders follow) and
/// advances its own state on each successful lifecycle call, the way a
/// well-behaved plugin must. Calls are appended to a shareable log as
/// `"<op>:<id>"` so tests can assert ordering across plugins.
pub struct TestPlugin {
    id: String,
    state: StateCell,
    metadata_deps: Vec<String>,
    fail_initialize: bool,
    fail_start: bool,
    fail_stop: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl TestPlugin {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: StateCell::new(PluginState::Loaded),
            metadata_deps: Vec::new(),
            fail_initialize: false,
            fail_start: false,
            fail_stop: false,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    pub fn with_metadata_deps(mut self, deps: &[&str]) -> Self {
        self.metadata_deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn build(self) -> Arc<TestPlugin> {
        Arc::new(self)
    }

    pub fn loaded(id: &str) -> BoxedPlugin {
        TestPlugin::new(id).build()
    }

    pub fn loaded_with_deps(id: &str, deps: &[&str]) -> BoxedPlugin {
        TestPlugin::new(id).with_metadata_deps(deps).build()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, op: &str) {
        self.log.lock().push(format!("{op}:{}", self.id));
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> PluginState {
        self.state.get()
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: self.id.clone(),
            name: self.id.clone(),
            version: Some("0.0.0".into()),
            description: None,
            author: None,
            dependencies: self.metadata_deps.clone(),
        }
    }

    async fn initialize(
        &self,
        _config: &PluginConfig,
        _lookup: &dyn PluginLookup,
    ) -> EngineResult<()> {
        self.record("initialize");
        if self.fail_initialize {
            self.state.set(PluginState::Failed);
            return Err(EngineError::PluginInitializationFailed {
                id: self.id.clone(),
                reason: "test plugin configured to fail initialize".into(),
            });
        }
        self.state.set(PluginState::Loaded);
        Ok(())
    }

    async fn start(&self, _services: &ServiceRegistry) -> EngineResult<()> {
        self.record("start");
        if self.fail_start {
            self.state.set(PluginState::Failed);
            return Err(EngineError::PluginStartFailed {
                id: self.id.clone(),
                reason: "test plugin configured to fail start".into(),
            });
        }
        self.state.set(PluginState::Active);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.record("stop");
        if self.fail_stop {
            self.state.set(PluginState::Failed);
            return Err(EngineError::PluginStopFailed {
                id: self.id.clone(),
                reason: "test plugin configured to fail stop".into(),
            });
        }
        self.state.set(PluginState::Suspended);
        Ok(())
    }

    async fn cleanup(&self) {
        self.record("cleanup");
        self.state.set(PluginState::Unloaded);
    }

    fn health(&self) -> PluginHealth {
        if self.state.get() == PluginState::Failed {
            PluginHealth::unhealthy(serde_json::json!({"reason": "test plugin failed"}))
        } else {
            PluginHealth::healthy()
        }
    }
}
