//! Turns a set of descriptors into a dependency-first load order.

use crate::descriptor::{DependencyPolicy, ModuleDescriptor};
use crate::graph::DependencyGraph;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },
}

/// A declared dependency that names no known module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub module: String,
    pub depends_on: String,
    /// Effective policy was strict: the module must not load.
    pub strict: bool,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// Every module, dependencies first; independent modules ordered by id.
    pub order: Vec<String>,
    pub graph: DependencyGraph,
    pub missing: Vec<MissingDependency>,
}

impl Resolution {
    /// Modules that declared a missing dependency under a strict policy.
    pub fn strict_failures(&self) -> impl Iterator<Item = &MissingDependency> {
        self.missing.iter().filter(|m| m.strict)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver {
    policy: DependencyPolicy,
}

impl DependencyResolver {
    pub fn new(policy: DependencyPolicy) -> Self {
        Self { policy }
    }

    /// Missing dependencies never abort resolution; their edges are dropped
    /// and reported. A cycle aborts it with the full path.
    pub fn resolve(&self, descriptors: &[ModuleDescriptor]) -> Result<Resolution, ResolveError> {
        let mut graph = DependencyGraph::new();
        for d in descriptors {
            graph.add_node(d.id.as_str());
        }

        let mut missing = Vec::new();
        for d in descriptors {
            let strict = d.dependency_policy.unwrap_or(self.policy) == DependencyPolicy::Strict;
            for dep in &d.dependencies {
                if graph.add_edge(&d.id, dep) {
                    continue;
                }
                if strict {
                    tracing::error!(
                        module = %d.id,
                        depends_on = %dep,
                        "Required dependency is not registered"
                    );
                } else {
                    tracing::warn!(
                        module = %d.id,
                        depends_on = %dep,
                        "Dependency is not registered; continuing without it"
                    );
                }
                missing.push(MissingDependency {
                    module: d.id.clone(),
                    depends_on: dep.clone(),
                    strict,
                });
            }
        }

        let order = graph.topo_order().map_err(|path| {
            tracing::error!(cycle = %path.join(" -> "), "Circular module dependency");
            ResolveError::CircularDependency { path }
        })?;

        tracing::debug!(order = ?order, "Resolved module order");
        Ok(Resolution {
            order,
            graph,
            missing,
        })
    }
}
