//! Shared service registry consumed by plugins.
//!
//! Plugins publish capabilities for one another as type-erased services
//! keyed by a string descriptor. Three lifetimes are supported:
//!
//! - **Singleton** — the factory runs once; every resolve returns the same
//!   instance.
//! - **Transient** — the factory runs on every resolve.
//! - **Scoped** — one instance per named scope; instances are dropped when
//!   the scope exits.
//!
//! The registry is `Send + Sync` and safe to share behind an `Arc`; the
//! engine passes a reference to every plugin's `start`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Controls how often a service factory is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// One shared instance for the registry's lifetime.
    Singleton,
    /// A fresh instance per resolve.
    Transient,
    /// One instance per active scope.
    Scoped,
}

/// A type-erased shared service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Factory producing a service instance on demand.
pub type ServiceFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

struct ServiceEntry {
    lifetime: ServiceLifetime,
    factory: ServiceFactory,
    singleton: Option<ServiceInstance>,
    scoped: HashMap<String, ServiceInstance>,
}

/// Descriptor-keyed service registry with lifetime management.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, ServiceEntry>>,
    current_scope: RwLock<Option<String>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `descriptor`, replacing any previous entry.
    pub fn register(
        &self,
        descriptor: impl Into<String>,
        factory: ServiceFactory,
        lifetime: ServiceLifetime,
    ) {
        let descriptor = descriptor.into();
        debug!(service = %descriptor, ?lifetime, "Service registered");
        self.entries.write().insert(
            descriptor,
            ServiceEntry {
                lifetime,
                factory,
                singleton: None,
                scoped: HashMap::new(),
            },
        );
    }

    /// Registers an already-constructed instance as a singleton.
    pub fn register_instance<T: Any + Send + Sync>(
        &self,
        descriptor: impl Into<String>,
        instance: Arc<T>,
    ) {
        let instance: ServiceInstance = instance;
        self.register(
            descriptor,
            Arc::new(move || Arc::clone(&instance)),
            ServiceLifetime::Singleton,
        );
    }

    /// Resolves a service instance, honoring its lifetime.
    ///
    /// Returns `None` when the descriptor is unknown, or when resolving a
    /// scoped service outside any scope.
    pub fn resolve(&self, descriptor: &str) -> Option<ServiceInstance> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(descriptor)?;
        match entry.lifetime {
            ServiceLifetime::Transient => Some((entry.factory)()),
            ServiceLifetime::Singleton => {
                if entry.singleton.is_none() {
                    entry.singleton = Some((entry.factory)());
                }
                entry.singleton.clone()
            }
            ServiceLifetime::Scoped => {
                let scope = self.current_scope.read().clone()?;
                if !entry.scoped.contains_key(&scope) {
                    let instance = (entry.factory)();
                    entry.scoped.insert(scope.clone(), instance);
                }
                entry.scoped.get(&scope).cloned()
            }
        }
    }

    /// Resolves and downcasts to a concrete type in one step.
    pub fn resolve_as<T: Any + Send + Sync>(&self, descriptor: &str) -> Option<Arc<T>> {
        self.resolve(descriptor)
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Removes a descriptor and every instance derived from it.
    pub fn unregister(&self, descriptor: &str) {
        if self.entries.write().remove(descriptor).is_some() {
            debug!(service = %descriptor, "Service unregistered");
        }
    }

    /// Whether a descriptor is registered.
    pub fn contains(&self, descriptor: &str) -> bool {
        self.entries.read().contains_key(descriptor)
    }

    /// All registered descriptors.
    pub fn descriptors(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Enters a named scope; scoped services resolved from now on are
    /// memoised under this name.
    pub fn enter_scope(&self, name: impl Into<String>) {
        *self.current_scope.write() = Some(name.into());
    }

    /// Leaves the current scope and drops its scoped instances.
    pub fn exit_scope(&self) {
        let scope = self.current_scope.write().take();
        if let Some(scope) = scope {
            let mut entries = self.entries.write();
            for entry in entries.values_mut() {
                entry.scoped.remove(&scope);
            }
        }
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
