//! Filesystem loader strategy.
//!
//! Resolves a plugin id against a base directory and an extension list,
//! trying `base/<id>.<ext>`, `base/<id>/index.<ext>`, `base/<id>/<id>.<ext>`
//! in that order. Files are JSON descriptors in one of two shapes:
//!
//! - **Factory descriptor** — carries a `"factory"` field naming a factory
//!   registered on the loader; the descriptor's `"config"` value is handed
//!   to it.
//! - **Instance descriptor** — the descriptor *is* the plugin: id plus
//!   metadata fields, materialised as a declarative [`DescriptorPlugin`]
//!   whose lifecycle just tracks state.
//!
//! With the module cache enabled, loads are memoised under the
//! canonicalized absolute path until [`FilesystemLoader::clear_cache`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::loader::PluginLoader;
use kiln_core::plugin::{
    BoxedPlugin, Plugin, PluginConfig, PluginHealth, PluginLookup, PluginMetadata, PluginState,
    StateCell,
};
use kiln_core::service::ServiceRegistry;

/// Factory invoked for descriptors with a `"factory"` field. Receives the
/// plugin id and the descriptor's `"config"` value.
pub type DescriptorFactory = Arc<dyn Fn(&str, Value) -> EngineResult<BoxedPlugin> + Send + Sync>;

/// Options for the filesystem loader.
#[derive(Debug, Clone)]
pub struct FilesystemLoaderConfig {
    /// Directory descriptor paths are resolved against.
    pub base_dir: PathBuf,
    /// Extensions tried per candidate pattern, in order.
    pub extensions: Vec<String>,
    /// Memoise loads keyed by canonicalized path.
    pub cache_modules: bool,
}

impl FilesystemLoaderConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            extensions: vec!["json".to_string()],
            cache_modules: true,
        }
    }
}

/// Loader over JSON plugin descriptors on disk.
pub struct FilesystemLoader {
    config: FilesystemLoaderConfig,
    factories: RwLock<HashMap<String, DescriptorFactory>>,
    cache: RwLock<HashMap<PathBuf, BoxedPlugin>>,
}

impl FilesystemLoader {
    pub fn new(config: FilesystemLoaderConfig) -> Self {
        Self {
            config,
            factories: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a factory that factory descriptors can reference by name.
    pub fn register_factory(&self, name: &str, factory: DescriptorFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    /// Drops every cached load.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// First existing candidate path for `id`, in contract order.
    fn resolve_path(&self, id: &str) -> Option<PathBuf> {
        let base = &self.config.base_dir;
        let candidates = |ext: &str| {
            [
                base.join(format!("{id}.{ext}")),
                base.join(id).join(format!("index.{ext}")),
                base.join(id).join(format!("{id}.{ext}")),
            ]
        };
        // Pattern-major: `<id>.<ext>` for every extension is preferred over
        // any `index.<ext>` form.
        for pattern in 0..3 {
            for ext in &self.config.extensions {
                let candidate = candidates(ext)[pattern].clone();
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn load_error(id: &str, reason: impl Into<String>) -> EngineError {
        EngineError::PluginLoadFailed {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    fn materialize(&self, id: &str, path: &Path) -> EngineResult<BoxedPlugin> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| Self::load_error(id, format!("{}: {error}", path.display())))?;
        let descriptor: Value = serde_json::from_str(&raw)
            .map_err(|error| Self::load_error(id, format!("invalid descriptor JSON: {error}")))?;

        let object = descriptor
            .as_object()
            .ok_or_else(|| Self::load_error(id, "descriptor must be a JSON object"))?;

        if let Some(factory_name) = object.get("factory") {
            let factory_name = factory_name
                .as_str()
                .ok_or_else(|| Self::load_error(id, "'factory' must be a string"))?;
            let factory = self
                .factories
                .read()
                .get(factory_name)
                .cloned()
                .ok_or_else(|| {
                    Self::load_error(id, format!("unknown factory '{factory_name}'"))
                })?;
            let factory_config = object.get("config").cloned().unwrap_or(Value::Null);
            let plugin = factory(id, factory_config)?;
            if plugin.id() != id {
                return Err(Self::load_error(
                    id,
                    format!("factory produced plugin id '{}'", plugin.id()),
                ));
            }
            return Ok(plugin);
        }

        // Plain instance descriptor.
        if let Some(declared) = object.get("id").and_then(Value::as_str)
            && declared != id
        {
            return Err(Self::load_error(
                id,
                format!("descriptor declares id '{declared}'"),
            ));
        }
        Ok(Arc::new(DescriptorPlugin::from_manifest(id, object)))
    }
}

#[async_trait]
impl PluginLoader for FilesystemLoader {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn can_load(&self, id: &str, _config: &PluginConfig) -> bool {
        self.resolve_path(id).is_some()
    }

    async fn load(&self, id: &str, _config: &PluginConfig) -> EngineResult<BoxedPlugin> {
        let path = self
            .resolve_path(id)
            .ok_or_else(|| Self::load_error(id, "no descriptor file found"))?;
        let canonical = std::fs::canonicalize(&path)
            .map_err(|error| Self::load_error(id, format!("{}: {error}", path.display())))?;

        if self.config.cache_modules
            && let Some(cached) = self.cache.read().get(&canonical)
        {
            debug!(plugin = %id, path = %canonical.display(), "Descriptor served from cache");
            return Ok(Arc::clone(cached));
        }

        let plugin = self.materialize(id, &canonical)?;
        if self.config.cache_modules {
            self.cache
                .write()
                .insert(canonical.clone(), Arc::clone(&plugin));
        }
        debug!(plugin = %id, path = %canonical.display(), "Descriptor loaded");
        Ok(plugin)
    }
}

// =============================================================================
// DescriptorPlugin
// =============================================================================

/// Declarative plugin materialised from an instance descriptor.
///
/// Carries metadata and state only; its lifecycle methods simply advance
/// the state machine. Useful for marker plugins and for wiring tested
/// descriptor files before the real implementation lands behind a factory.
pub struct DescriptorPlugin {
    id: String,
    metadata: PluginMetadata,
    defaults: Value,
    state: StateCell,
}

impl DescriptorPlugin {
    fn from_manifest(id: &str, manifest: &serde_json::Map<String, Value>) -> Self {
        let text = |key: &str| {
            manifest
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let metadata = PluginMetadata {
            id: id.to_string(),
            name: text("name").unwrap_or_else(|| id.to_string()),
            version: text("version"),
            description: text("description"),
            author: text("author"),
            dependencies: manifest
                .get("dependencies")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        Self {
            id: id.to_string(),
            metadata,
            defaults: manifest.get("config").cloned().unwrap_or(Value::Null),
            state: StateCell::new(PluginState::Loaded),
        }
    }

    /// The descriptor's `"config"` section, if any.
    pub fn defaults(&self) -> &Value {
        &self.defaults
    }
}

#[async_trait]
impl Plugin for DescriptorPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> PluginState {
        self.state.get()
    }

    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    async fn initialize(
        &self,
        _config: &PluginConfig,
        _lookup: &dyn PluginLookup,
    ) -> EngineResult<()> {
        self.state.set(PluginState::Loaded);
        Ok(())
    }

    async fn start(&self, _services: &ServiceRegistry) -> EngineResult<()> {
        self.state.set(PluginState::Active);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.state.set(PluginState::Suspended);
        Ok(())
    }

    async fn cleanup(&self) {
        self.state.set(PluginState::Unloaded);
    }

    fn health(&self) -> PluginHealth {
        PluginHealth::healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestPlugin;
    use serde_json::json;

    fn write(dir: &Path, rel: &str, value: &Value) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn loader(dir: &Path) -> FilesystemLoader {
        FilesystemLoader::new(FilesystemLoaderConfig::new(dir))
    }

    #[tokio::test]
    async fn instance_descriptor_becomes_a_descriptor_plugin() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "greeter.json",
            &json!({"id": "greeter", "name": "Greeter", "version": "1.2.0"}),
        );

        let loader = loader(dir.path());
        let config = PluginConfig::new("greeter");
        assert!(loader.can_load("greeter", &config));

        let plugin = loader.load("greeter", &config).await.unwrap();
        assert_eq!(plugin.id(), "greeter");
        assert_eq!(plugin.state(), PluginState::Loaded);
        assert_eq!(plugin.metadata().version.as_deref(), Some("1.2.0"));
    }

    #[tokio::test]
    async fn candidate_paths_are_tried_in_order() {
        let dir = tempfile::tempdir().unwrap();
        // Both forms exist; the flat `<id>.json` must win.
        write(dir.path(), "dual/index.json", &json!({"name": "nested"}));
        write(dir.path(), "dual.json", &json!({"name": "flat"}));
        write(dir.path(), "nested/index.json", &json!({"name": "idx"}));
        write(dir.path(), "named/named.json", &json!({"name": "named"}));

        let loader = loader(dir.path());
        let config = PluginConfig::new("x");

        let dual = loader.load("dual", &config).await.unwrap();
        assert_eq!(dual.metadata().name, "flat");
        let nested = loader.load("nested", &config).await.unwrap();
        assert_eq!(nested.metadata().name, "idx");
        let named = loader.load("named", &config).await.unwrap();
        assert_eq!(named.metadata().name, "named");
    }

    #[tokio::test]
    async fn factory_descriptor_invokes_registered_factory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "worker.json",
            &json!({"factory": "make-worker", "config": {"threads": 4}}),
        );

        let loader = loader(dir.path());
        loader.register_factory(
            "make-worker",
            Arc::new(|id, config| {
                assert_eq!(config["threads"], 4);
                Ok(TestPlugin::loaded(id))
            }),
        );

        let plugin = loader
            .load("worker", &PluginConfig::new("worker"))
            .await
            .unwrap();
        assert_eq!(plugin.id(), "worker");
    }

    #[tokio::test]
    async fn unknown_factory_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bad.json", &json!({"factory": "nope"}));

        let loader = loader(dir.path());
        let result = loader.load("bad", &PluginConfig::new("bad")).await;
        assert!(matches!(result, Err(EngineError::PluginLoadFailed { .. })));
    }

    #[tokio::test]
    async fn mismatched_descriptor_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.json", &json!({"id": "beta"}));

        let loader = loader(dir.path());
        let result = loader.load("alpha", &PluginConfig::new("alpha")).await;
        assert!(matches!(result, Err(EngineError::PluginLoadFailed { .. })));
    }

    #[tokio::test]
    async fn cache_is_keyed_by_canonical_path_and_clearable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "p.json", &json!({"name": "P"}));

        let loader = loader(dir.path());
        let config = PluginConfig::new("p");
        let first = loader.load("p", &config).await.unwrap();
        let second = loader.load("p", &config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        loader.clear_cache();
        let third = loader.load("p", &config).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn missing_descriptor_rejects_can_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        assert!(!loader.can_load("ghost", &PluginConfig::new("ghost")));
        assert!(loader.load("ghost", &PluginConfig::new("ghost")).await.is_err());
    }
}
