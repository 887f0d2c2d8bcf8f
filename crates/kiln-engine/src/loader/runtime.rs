//! In-process loader strategy.
//!
//! Plugins are registered ahead of time under their id as one of three
//! sources: a direct instance, a factory invoked per load, or a zero-arg
//! constructor. An optional capacity-bounded instance cache memoises
//! factory/constructor products, evicting in FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::loader::PluginLoader;
use kiln_core::plugin::{BoxedPlugin, PluginConfig};

/// Factory signature for [`RuntimeLoader::register_factory`].
pub type RuntimeFactory = Arc<dyn Fn(&PluginConfig) -> EngineResult<BoxedPlugin> + Send + Sync>;

enum PluginSource {
    Instance(BoxedPlugin),
    Factory(RuntimeFactory),
    Constructor(fn() -> BoxedPlugin),
}

/// Options for the runtime loader.
#[derive(Debug, Clone)]
pub struct RuntimeLoaderConfig {
    /// Memoise factory/constructor products per id.
    pub cache_instances: bool,
    /// Cache entries beyond this evict the oldest first.
    pub cache_capacity: usize,
}

impl Default for RuntimeLoaderConfig {
    fn default() -> Self {
        Self {
            cache_instances: false,
            cache_capacity: 16,
        }
    }
}

/// Loader over plugins supplied directly by the host process.
pub struct RuntimeLoader {
    config: RuntimeLoaderConfig,
    sources: RwLock<HashMap<String, PluginSource>>,
    cache: Mutex<VecDeque<(String, BoxedPlugin)>>,
}

impl Default for RuntimeLoader {
    fn default() -> Self {
        Self::new(RuntimeLoaderConfig::default())
    }
}

impl RuntimeLoader {
    pub fn new(config: RuntimeLoaderConfig) -> Self {
        Self {
            config,
            sources: RwLock::new(HashMap::new()),
            cache: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a ready-made instance; validated immediately.
    pub fn register_instance(&self, id: &str, plugin: BoxedPlugin) -> EngineResult<()> {
        validate_surface(id, &plugin)?;
        self.sources
            .write()
            .insert(id.to_string(), PluginSource::Instance(plugin));
        debug!(plugin = %id, source = "instance", "Runtime plugin source registered");
        Ok(())
    }

    /// Registers a factory invoked on each load (unless the instance cache
    /// serves a hit first). Its product is validated at load time.
    pub fn register_factory(&self, id: &str, factory: RuntimeFactory) {
        self.sources
            .write()
            .insert(id.to_string(), PluginSource::Factory(factory));
        debug!(plugin = %id, source = "factory", "Runtime plugin source registered");
    }

    /// Registers a zero-arg constructor.
    pub fn register_constructor(&self, id: &str, constructor: fn() -> BoxedPlugin) {
        self.sources
            .write()
            .insert(id.to_string(), PluginSource::Constructor(constructor));
        debug!(plugin = %id, source = "constructor", "Runtime plugin source registered");
    }

    /// Removes a registered source.
    pub fn unregister(&self, id: &str) -> bool {
        self.sources.write().remove(id).is_some()
    }

    /// Drops every cached instance.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn cache_lookup(&self, id: &str) -> Option<BoxedPlugin> {
        self.cache
            .lock()
            .iter()
            .find(|(cached_id, _)| cached_id == id)
            .map(|(_, plugin)| Arc::clone(plugin))
    }

    fn cache_store(&self, id: &str, plugin: &BoxedPlugin) {
        let mut cache = self.cache.lock();
        if cache.len() >= self.config.cache_capacity {
            cache.pop_front();
        }
        cache.push_back((id.to_string(), Arc::clone(plugin)));
    }
}

fn validate_surface(id: &str, plugin: &BoxedPlugin) -> EngineResult<()> {
    if plugin.id().is_empty() {
        return Err(EngineError::PluginRegistrationFailed {
            id: id.to_string(),
            reason: "plugin reports an empty id".into(),
        });
    }
    if plugin.id() != id {
        return Err(EngineError::PluginRegistrationFailed {
            id: id.to_string(),
            reason: format!("plugin reports id '{}'", plugin.id()),
        });
    }
    if plugin.metadata().id != id {
        return Err(EngineError::PluginRegistrationFailed {
            id: id.to_string(),
            reason: format!("metadata id '{}' does not match", plugin.metadata().id),
        });
    }
    Ok(())
}

#[async_trait]
impl PluginLoader for RuntimeLoader {
    fn name(&self) -> &str {
        "runtime"
    }

    fn can_load(&self, id: &str, _config: &PluginConfig) -> bool {
        self.sources.read().contains_key(id)
    }

    async fn load(&self, id: &str, config: &PluginConfig) -> EngineResult<BoxedPlugin> {
        enum Produce {
            Ready(BoxedPlugin),
            FromFactory(RuntimeFactory),
            FromConstructor(fn() -> BoxedPlugin),
        }

        let produce = {
            let sources = self.sources.read();
            match sources.get(id) {
                Some(PluginSource::Instance(plugin)) => Produce::Ready(Arc::clone(plugin)),
                Some(PluginSource::Factory(factory)) => Produce::FromFactory(Arc::clone(factory)),
                Some(PluginSource::Constructor(constructor)) => {
                    Produce::FromConstructor(*constructor)
                }
                None => {
                    return Err(EngineError::PluginLoadFailed {
                        id: id.to_string(),
                        reason: "no runtime source registered".into(),
                    });
                }
            }
        };

        let plugin = match produce {
            Produce::Ready(plugin) => plugin,
            Produce::FromFactory(factory) => {
                if self.config.cache_instances
                    && let Some(cached) = self.cache_lookup(id)
                {
                    return Ok(cached);
                }
                let plugin = factory(config)?;
                validate_surface(id, &plugin)?;
                if self.config.cache_instances {
                    self.cache_store(id, &plugin);
                }
                plugin
            }
            Produce::FromConstructor(constructor) => {
                if self.config.cache_instances
                    && let Some(cached) = self.cache_lookup(id)
                {
                    return Ok(cached);
                }
                let plugin = constructor();
                validate_surface(id, &plugin)?;
                if self.config.cache_instances {
                    self.cache_store(id, &plugin);
                }
                plugin
            }
        };

        Ok(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestPlugin;

    fn cfg(id: &str) -> PluginConfig {
        PluginConfig::new(id)
    }

    #[tokio::test]
    async fn instance_source_returns_the_same_plugin() {
        let loader = RuntimeLoader::default();
        let plugin = TestPlugin::loaded("a");
        loader.register_instance("a", Arc::clone(&plugin)).unwrap();

        assert!(loader.can_load("a", &cfg("a")));
        let loaded = loader.load("a", &cfg("a")).await.unwrap();
        assert!(Arc::ptr_eq(&plugin, &loaded));
    }

    #[tokio::test]
    async fn factory_runs_per_load_without_cache() {
        let loader = RuntimeLoader::default();
        loader.register_factory(
            "a",
            Arc::new(|config| Ok(TestPlugin::loaded(&config.id))),
        );

        let first = loader.load("a", &cfg("a")).await.unwrap();
        let second = loader.load("a", &cfg("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn instance_cache_memoises_factory_products() {
        let loader = RuntimeLoader::new(RuntimeLoaderConfig {
            cache_instances: true,
            cache_capacity: 4,
        });
        loader.register_factory(
            "a",
            Arc::new(|config| Ok(TestPlugin::loaded(&config.id))),
        );

        let first = loader.load("a", &cfg("a")).await.unwrap();
        let second = loader.load("a", &cfg("a")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        loader.clear_cache();
        let third = loader.load("a", &cfg("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn cache_evicts_fifo_at_capacity() {
        let loader = RuntimeLoader::new(RuntimeLoaderConfig {
            cache_instances: true,
            cache_capacity: 2,
        });
        for id in ["a", "b", "c"] {
            loader.register_factory(
                id,
                Arc::new(|config: &PluginConfig| Ok(TestPlugin::loaded(&config.id))),
            );
        }

        let a1 = loader.load("a", &cfg("a")).await.unwrap();
        loader.load("b", &cfg("b")).await.unwrap();
        loader.load("c", &cfg("c")).await.unwrap(); // evicts "a"

        let a2 = loader.load("a", &cfg("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&a1, &a2));
    }

    #[tokio::test]
    async fn registration_validates_id_consistency() {
        let loader = RuntimeLoader::default();
        let result = loader.register_instance("expected", TestPlugin::loaded("other"));
        assert!(matches!(
            result,
            Err(EngineError::PluginRegistrationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected_by_can_load() {
        let loader = RuntimeLoader::default();
        assert!(!loader.can_load("ghost", &cfg("ghost")));
    }
}
