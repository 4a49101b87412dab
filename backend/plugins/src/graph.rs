//! Dependency graph
//!
//! Records which module identities each loader pulled in while it was being
//! compiled or initialised. Reload walks this graph to purge every cached
//! module a mod transitively depends on.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use crate::source::SourceId;

/// Loader identity -> identities it required, in first-require order.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<SourceId, IndexSet<SourceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `loader` required `dependency`.
    ///
    /// Returns `false` when the edge already existed; repeated requires of the
    /// same dependency collapse to one edge.
    pub fn record_edge(&mut self, loader: &SourceId, dependency: &SourceId) -> bool {
        self.edges
            .entry(loader.clone())
            .or_default()
            .insert(dependency.clone())
    }

    /// Direct dependencies of `id`.
    pub fn dependencies<'a>(&'a self, id: &SourceId) -> impl Iterator<Item = &'a SourceId> + 'a {
        self.edges.get(id).into_iter().flat_map(|deps| deps.iter())
    }

    /// Depth-first walk over everything reachable from `id`, excluding `id`
    /// itself. Each identity is yielded once, so cycles terminate.
    pub fn transitive_dependencies<'a>(&'a self, id: &'a SourceId) -> TransitiveDependencies<'a> {
        let mut visited = HashSet::new();
        visited.insert(id);
        let mut walk = TransitiveDependencies {
            graph: self,
            stack: Vec::new(),
            visited,
            revisits: 0,
        };
        walk.push_children(id);
        walk
    }

    /// Drop the outgoing edges of `id`. A fresh compile re-records them.
    pub fn forget(&mut self, id: &SourceId) -> bool {
        self.edges.remove(id).is_some()
    }

    /// Number of loaders with at least one recorded edge.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(IndexSet::len).sum()
    }
}

/// Lazy traversal returned by [`DependencyGraph::transitive_dependencies`].
pub struct TransitiveDependencies<'a> {
    graph: &'a DependencyGraph,
    stack: Vec<&'a SourceId>,
    visited: HashSet<&'a SourceId>,
    revisits: usize,
}

impl<'a> TransitiveDependencies<'a> {
    fn push_children(&mut self, id: &SourceId) {
        if let Some(deps) = self.graph.edges.get(id) {
            // Reversed so the first recorded dependency is visited first.
            self.stack.extend(deps.iter().rev());
        }
    }

    /// Edges skipped so far because they pointed at an already visited node
    /// (a cycle or a shared dependency).
    pub fn revisits(&self) -> usize {
        self.revisits
    }
}

impl<'a> Iterator for TransitiveDependencies<'a> {
    type Item = &'a SourceId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(next) = self.stack.pop() {
            if !self.visited.insert(next) {
                self.revisits += 1;
                continue;
            }
            self.push_children(next);
            return Some(next);
        }
        None
    }
}
