//! Built-in loader strategies.
//!
//! The [`PluginLoader`](kiln_core::loader::PluginLoader) contract lives in
//! `kiln-core`; this module provides the two built-in strategies:
//!
//! - [`RuntimeLoader`] — plugins registered in process as direct instances,
//!   factories, or constructors.
//! - [`FilesystemLoader`] — plugins described by JSON descriptor files
//!   resolved against a base directory.
//!
//! The engine tries its loaders in configured order and uses the first
//! whose `can_load` accepts the id.

pub mod filesystem;
pub mod runtime;

pub use filesystem::{
    DescriptorFactory, DescriptorPlugin, FilesystemLoader, FilesystemLoaderConfig,
};
pub use runtime::{RuntimeFactory, RuntimeLoader, RuntimeLoaderConfig};
