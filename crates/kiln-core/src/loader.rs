//! Loader strategy contract.
//!
//! A loader resolves a plugin id plus its config into a live plugin
//! instance. The engine holds an ordered list of loaders and, for each
//! enabled config, asks them in turn via [`PluginLoader::can_load`]; the
//! first strategy that accepts the id performs the load. Loaders are
//! supplied at engine construction; there is no discovery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::plugin::{BoxedPlugin, PluginConfig};

/// Strategy for resolving a plugin id into an instance.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Display name used in logs and load-failure reasons.
    fn name(&self) -> &str;

    /// Whether this strategy can produce a plugin for `id`.
    ///
    /// Must be cheap; the engine calls it for every loader in order until
    /// one accepts.
    fn can_load(&self, id: &str, config: &PluginConfig) -> bool;

    /// Produces the plugin instance.
    ///
    /// Errors are wrapped by the engine into
    /// [`EngineError::PluginLoadFailed`](crate::error::EngineError::PluginLoadFailed)
    /// with this loader's failure as the cause.
    async fn load(&self, id: &str, config: &PluginConfig) -> EngineResult<BoxedPlugin>;
}

/// A shared loader trait object.
pub type BoxedLoader = Arc<dyn PluginLoader>;
