//! Dependency resolver: turns the catalogue into a deterministic load plan.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use thiserror::Error;

use crate::manifest::ModuleDescriptor;

/// Modules in load order: every dependency precedes its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    modules: Vec<ModuleDescriptor>,
}

impl LoadPlan {
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn ids(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.module_id.as_str()).collect()
    }

    pub fn position(&self, module_id: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.module_id == module_id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn into_modules(self) -> Vec<ModuleDescriptor> {
        self.modules
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module '{module}' depends on unknown module(s): {}", missing.join(", "))]
    UnresolvedDependency { module: String, missing: Vec<String> },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("module '{0}' appears more than once in the catalogue")]
    DuplicateModule(String),
}

/// Resolve `catalogue` into a [`LoadPlan`].
///
/// Modules with no ordering constraint between them keep their catalogue order,
/// so resolving the same catalogue always yields the same plan.
pub fn resolve(catalogue: &[ModuleDescriptor]) -> Result<LoadPlan, ResolveError> {
    let mut idx: HashMap<&str, usize> = HashMap::with_capacity(catalogue.len());
    for (i, m) in catalogue.iter().enumerate() {
        if idx.insert(m.module_id.as_str(), i).is_some() {
            return Err(ResolveError::DuplicateModule(m.module_id.clone()));
        }
    }

    // 1) every dependency must be present
    for m in catalogue {
        let missing: Vec<String> = m
            .dependencies
            .iter()
            .filter(|d| !idx.contains_key(d.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ResolveError::UnresolvedDependency {
                module: m.module_id.clone(),
                missing,
            });
        }
    }

    // 2) edges point from dependent to dependency
    let deps_of: Vec<Vec<usize>> = catalogue
        .iter()
        .map(|m| m.dependencies.iter().map(|d| idx[d.as_str()]).collect())
        .collect();

    if let Some(cycle) = detect_cycle_with_path(catalogue, &deps_of) {
        return Err(ResolveError::CyclicDependency { path: cycle });
    }

    // 3) Kahn's algorithm; the ready set is a min-heap on catalogue index
    let mut dependents = vec![Vec::<usize>::new(); catalogue.len()];
    let mut indeg = vec![0usize; catalogue.len()];
    for (u, deps) in deps_of.iter().enumerate() {
        indeg[u] = deps.len();
        for &d in deps {
            dependents[d].push(u);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indeg
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(catalogue.len());
    while let Some(Reverse(u)) = ready.pop() {
        order.push(u);
        for &w in &dependents[u] {
            indeg[w] -= 1;
            if indeg[w] == 0 {
                ready.push(Reverse(w));
            }
        }
    }

    let modules: Vec<ModuleDescriptor> = order.into_iter().map(|i| catalogue[i].clone()).collect();

    tracing::info!(
        modules = ?modules.iter().map(|m| m.module_id.as_str()).collect::<Vec<_>>(),
        "Module dependency order resolved (topo)"
    );

    Ok(LoadPlan { modules })
}

/// DFS with path tracking; returns the closed cycle (`a -> b -> a`) if any.
fn detect_cycle_with_path(
    catalogue: &[ModuleDescriptor],
    deps_of: &[Vec<usize>],
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White, // unvisited
        Gray,  // on current path
        Black, // finished
    }

    fn dfs(
        node: usize,
        deps_of: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &deps_of[node] {
            match colors[next] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, deps_of, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; catalogue.len()];
    let mut path = Vec::new();
    for i in 0..catalogue.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, deps_of, &mut colors, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|n| catalogue[n].module_id.clone())
                        .collect(),
                );
            }
        }
    }
    None
}
