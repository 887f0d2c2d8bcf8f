//! Indexed store of loaded plugins.
//!
//! The primary index maps plugin id to its [`PluginRecord`]; secondary
//! indices by state and by type are kept in sync on register, unregister,
//! and [`PluginRegistry::update_state`]. All operations are O(1) amortized
//! hash work plus index maintenance; reads hand out cloned snapshots so no
//! lock is held by callers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::plugin::{BoxedPlugin, PluginConfig, PluginLookup, PluginState, PluginType};

/// Everything the engine tracks for one loaded plugin.
pub struct PluginRecord {
    /// The live plugin instance.
    pub plugin: BoxedPlugin,
    /// The config it was loaded from.
    pub config: PluginConfig,
    /// Config dependencies merged with the metadata's declared ones.
    pub dependencies: Vec<String>,
}

impl PluginRecord {
    /// Builds a record, merging config and metadata dependency lists.
    pub fn new(plugin: BoxedPlugin, config: PluginConfig) -> Self {
        let mut dependencies = config.dependencies.clone();
        for dep in plugin.metadata().dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        Self {
            plugin,
            config,
            dependencies,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    plugins: HashMap<String, Arc<PluginRecord>>,
    by_state: HashMap<PluginState, BTreeSet<String>>,
    by_type: HashMap<PluginType, BTreeSet<String>>,
}

impl RegistryInner {
    fn detach(&mut self, id: &str) {
        for ids in self.by_state.values_mut() {
            ids.remove(id);
        }
        for ids in self.by_type.values_mut() {
            ids.remove(id);
        }
    }
}

/// Thread-safe plugin store with state and type indices.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record under its config id.
    ///
    /// Replacing an existing id first detaches the old entry from both
    /// secondary indices.
    pub fn register(&self, record: PluginRecord) -> EngineResult<()> {
        let id = record.config.id.clone();
        if id.is_empty() {
            return Err(EngineError::PluginRegistrationFailed {
                id,
                reason: "plugin id must not be empty".into(),
            });
        }

        let mut inner = self.inner.write();
        if inner.plugins.contains_key(&id) {
            inner.detach(&id);
        }
        let state = record.plugin.state();
        let plugin_type = record.config.plugin_type;
        inner.plugins.insert(id.clone(), Arc::new(record));
        inner.by_state.entry(state).or_default().insert(id.clone());
        inner
            .by_type
            .entry(plugin_type)
            .or_default()
            .insert(id.clone());
        debug!(plugin = %id, state = %state, "Plugin registered");
        Ok(())
    }

    /// Removes a plugin and detaches its index entries.
    pub fn unregister(&self, id: &str) -> Option<Arc<PluginRecord>> {
        let mut inner = self.inner.write();
        let record = inner.plugins.remove(id);
        if record.is_some() {
            inner.detach(id);
            debug!(plugin = %id, "Plugin unregistered");
        }
        record
    }

    /// Moves a plugin between state index buckets.
    pub fn update_state(
        &self,
        id: &str,
        old: PluginState,
        new: PluginState,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if !inner.plugins.contains_key(id) {
            return Err(EngineError::PluginNotFound { id: id.to_string() });
        }
        if let Some(ids) = inner.by_state.get_mut(&old) {
            ids.remove(id);
        }
        inner
            .by_state
            .entry(new)
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    /// Returns the record for `id`.
    pub fn get(&self, id: &str) -> Option<Arc<PluginRecord>> {
        self.inner.read().plugins.get(id).cloned()
    }

    /// Returns just the plugin instance for `id`.
    pub fn plugin(&self, id: &str) -> Option<BoxedPlugin> {
        self.inner
            .read()
            .plugins
            .get(id)
            .map(|record| Arc::clone(&record.plugin))
    }

    /// The state bucket a plugin currently sits in, per the index.
    pub fn tracked_state(&self, id: &str) -> Option<PluginState> {
        let inner = self.inner.read();
        inner
            .by_state
            .iter()
            .find(|(_, ids)| ids.contains(id))
            .map(|(state, _)| *state)
    }

    /// All registered ids.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().plugins.keys().cloned().collect()
    }

    /// Ids currently tracked in `state`.
    pub fn ids_in_state(&self, state: PluginState) -> Vec<String> {
        self.inner
            .read()
            .by_state
            .get(&state)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids registered under `plugin_type`.
    pub fn ids_of_type(&self, plugin_type: PluginType) -> Vec<String> {
        self.inner
            .read()
            .by_type
            .get(&plugin_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Map of id to tracked state for every registered plugin.
    pub fn states(&self) -> HashMap<String, PluginState> {
        let inner = self.inner.read();
        let mut states = HashMap::with_capacity(inner.plugins.len());
        for (state, ids) in &inner.by_state {
            for id in ids {
                states.insert(id.clone(), *state);
            }
        }
        states
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.inner.read().plugins.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().plugins.is_empty()
    }

    /// Drops every plugin and index entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.plugins.clear();
        inner.by_state.clear();
        inner.by_type.clear();
    }
}

impl PluginLookup for PluginRegistry {
    fn get_plugin(&self, id: &str) -> Option<BoxedPlugin> {
        self.plugin(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestPlugin;

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(TestPlugin::loaded(id), PluginConfig::new(id))
    }

    #[test]
    fn register_then_unregister_restores_empty_registry() {
        let registry = PluginRegistry::new();
        registry.register(record("a")).unwrap();
        registry.unregister("a").unwrap();

        assert!(registry.is_empty());
        assert!(registry.ids_in_state(PluginState::Loaded).is_empty());
        assert!(registry.ids_of_type(PluginType::User).is_empty());
    }

    #[test]
    fn empty_id_is_rejected() {
        let registry = PluginRegistry::new();
        let result = registry.register(record(""));
        assert!(matches!(
            result,
            Err(EngineError::PluginRegistrationFailed { .. })
        ));
    }

    #[test]
    fn replacement_detaches_old_index_entries() {
        let registry = PluginRegistry::new();
        registry.register(record("a")).unwrap();
        registry.update_state("a", PluginState::Loaded, PluginState::Active).unwrap();

        // Re-register the same id; the Active bucket entry must not leak.
        registry.register(record("a")).unwrap();
        assert!(registry.ids_in_state(PluginState::Active).is_empty());
        assert_eq!(registry.ids_in_state(PluginState::Loaded), ["a"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_state_moves_between_buckets() {
        let registry = PluginRegistry::new();
        registry.register(record("a")).unwrap();

        registry.update_state("a", PluginState::Loaded, PluginState::Active).unwrap();
        assert!(registry.ids_in_state(PluginState::Loaded).is_empty());
        assert_eq!(registry.ids_in_state(PluginState::Active), ["a"]);
        assert_eq!(registry.tracked_state("a"), Some(PluginState::Active));

        assert!(matches!(
            registry.update_state("ghost", PluginState::Loaded, PluginState::Active),
            Err(EngineError::PluginNotFound { .. })
        ));
    }

    #[test]
    fn lookup_exposes_plugins() {
        let registry = PluginRegistry::new();
        registry.register(record("a")).unwrap();
        let lookup: &dyn PluginLookup = &registry;
        assert_eq!(lookup.get_plugin("a").unwrap().id(), "a");
        assert!(lookup.get_plugin("b").is_none());
    }

    #[test]
    fn dependencies_merge_config_and_metadata() {
        let plugin = TestPlugin::loaded_with_deps("a", &["m1"]);
        let config = PluginConfig::new("a").with_dependency("c1").with_dependency("m1");
        let record = PluginRecord::new(plugin, config);
        assert_eq!(record.dependencies, ["c1", "m1"]);
    }
}
