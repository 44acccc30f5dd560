//! Static dependency graph between services.

use std::collections::{BTreeMap, BTreeSet};

use crate::compose::{DependencyCondition, Deployment};
use crate::error::ManifestError;

/// One dependency edge: `service` waits for `dependency` to reach `condition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub dependency: String,
    pub condition: DependencyCondition,
}

/// Validated dependency graph with a layered start order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<Edge>>,
    layers: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Builds the graph, rejecting unknown dependencies, health conditions on
    /// services without a probe, and cycles.
    pub fn from_deployment(deployment: &Deployment) -> Result<Self, ManifestError> {
        let mut edges: BTreeMap<String, Vec<Edge>> = BTreeMap::new();

        for (name, spec) in &deployment.services {
            let mut service_edges = Vec::with_capacity(spec.depends_on.len());
            for (dependency, dep) in &spec.depends_on {
                let target = deployment.services.get(dependency).ok_or_else(|| {
                    ManifestError::UnknownDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;

                if dep.condition == DependencyCondition::ServiceHealthy && target.probe().is_none() {
                    return Err(ManifestError::HealthConditionWithoutProbe {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                }

                service_edges.push(Edge {
                    dependency: dependency.clone(),
                    condition: dep.condition,
                });
            }
            edges.insert(name.clone(), service_edges);
        }

        let plain: BTreeMap<String, BTreeSet<String>> = edges
            .iter()
            .map(|(name, deps)| {
                (name.clone(), deps.iter().map(|e| e.dependency.clone()).collect())
            })
            .collect();
        let layers = layer(&plain).map_err(ManifestError::DependencyCycle)?;

        Ok(Self { edges, layers })
    }

    /// Services grouped by start layer; every service's dependencies are in
    /// earlier layers.
    pub fn start_order(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Start order flattened into one list.
    pub fn flat_order(&self) -> Vec<String> {
        self.layers.iter().flatten().cloned().collect()
    }

    /// Dependency edges of a service.
    pub fn dependencies(&self, service: &str) -> &[Edge] {
        self.edges.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Services that directly depend on `service`.
    pub fn dependents(&self, service: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|e| e.dependency == service))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Every service that transitively depends on `service`.
    pub fn transitive_dependents(&self, service: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![service.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(&current) {
                if seen.insert(dependent.to_string()) {
                    stack.push(dependent.to_string());
                }
            }
        }
        seen
    }

    /// All service names.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Groups nodes into layers (Kahn's algorithm). On a cycle, returns the
/// nodes that could not be ordered.
pub fn layer(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<Vec<String>>, Vec<String>> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = edges
        .iter()
        .map(|(name, deps)| {
            (
                name.as_str(),
                deps.iter()
                    .map(String::as_str)
                    .filter(|d| edges.contains_key(*d))
                    .collect(),
            )
        })
        .collect();

    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            return Err(remaining.keys().map(|s| s.to_string()).collect());
        }

        for name in &ready {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }
        layers.push(ready.into_iter().map(String::from).collect());
    }

    Ok(layers)
}
