//! Dependency-respecting startup ordering.
//!
//! Kahn's algorithm over the graph where an edge `A → B` means "A depends
//! on B", so B must come earlier in the startup order. Missing dependencies
//! and cycles are reported as structured errors rather than partial orders.
//!
//! When several plugins are ready at once the resolver breaks the tie by
//! type (`System ≺ Library ≺ User`), then by descending priority, then by
//! id, so identical inputs always yield identical plans.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use kiln_core::error::{EngineError, EngineResult};
use kiln_core::plugin::{PluginConfig, PluginType};

/// The resolved orders for a config set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Dependency-respecting initialization/start order.
    pub startup_order: Vec<String>,
    /// Exact reverse of `startup_order`, used for stop and cleanup.
    pub shutdown_order: Vec<String>,
    /// Number of plugins in the plan.
    pub total: usize,
}

struct ReadyNode {
    plugin_type: PluginType,
    priority: u32,
    id: String,
}

impl PartialEq for ReadyNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ReadyNode {}

impl PartialOrd for ReadyNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyNode {
    // Max-heap: "greater" pops first. System before Library before User,
    // then higher priority, then lexicographically smaller id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .plugin_type
            .cmp(&self.plugin_type)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Topological resolver over plugin configs.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Computes the startup and shutdown orders for `configs`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::MissingDependencies`] when a config names a
    ///   dependency absent from the set, listed as `"dependent -> missing"`.
    /// - [`EngineError::CircularDependency`] with the ids left over after
    ///   the sort, i.e. the nodes participating in (or downstream of) a
    ///   cycle.
    pub fn resolve(configs: &[PluginConfig]) -> EngineResult<ResolutionPlan> {
        let by_id: HashMap<&str, &PluginConfig> =
            configs.iter().map(|cfg| (cfg.id.as_str(), cfg)).collect();

        let mut missing: Vec<String> = Vec::new();
        for cfg in configs {
            for dep in &cfg.dependencies {
                if !by_id.contains_key(dep.as_str()) {
                    missing.push(format!("{} -> {}", cfg.id, dep));
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(EngineError::MissingDependencies { missing });
        }

        // in-degree = number of unsatisfied dependencies; dependents[B]
        // lists the As waiting on B.
        let mut in_degree: HashMap<&str, usize> =
            configs.iter().map(|cfg| (cfg.id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            configs.iter().map(|cfg| (cfg.id.as_str(), Vec::new())).collect();
        for cfg in configs {
            for dep in &cfg.dependencies {
                dependents
                    .get_mut(dep.as_str())
                    .expect("dependency presence checked above")
                    .push(cfg.id.as_str());
                *in_degree.get_mut(cfg.id.as_str()).unwrap() += 1;
            }
        }

        let mut ready: BinaryHeap<ReadyNode> = configs
            .iter()
            .filter(|cfg| in_degree[cfg.id.as_str()] == 0)
            .map(|cfg| ReadyNode {
                plugin_type: cfg.plugin_type,
                priority: cfg.priority,
                id: cfg.id.clone(),
            })
            .collect();

        let mut startup_order: Vec<String> = Vec::with_capacity(configs.len());
        while let Some(node) = ready.pop() {
            for dependent in &dependents[node.id.as_str()] {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    let cfg = by_id[dependent];
                    ready.push(ReadyNode {
                        plugin_type: cfg.plugin_type,
                        priority: cfg.priority,
                        id: cfg.id.clone(),
                    });
                }
            }
            startup_order.push(node.id);
        }

        if startup_order.len() != configs.len() {
            let mut involved: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            involved.sort();
            return Err(EngineError::CircularDependency { involved });
        }

        let shutdown_order: Vec<String> = startup_order.iter().rev().cloned().collect();
        Ok(ResolutionPlan {
            total: startup_order.len(),
            startup_order,
            shutdown_order,
        })
    }
}
