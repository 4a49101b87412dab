//! Module Loader
//!
//! Resolves names through the [`ModuleSource`], serves compiled modules from
//! the cache, and records a dependency edge every time one module requires
//! another. Cache purges cascade along those edges.

use std::any::Any;
use std::collections::HashMap;
use std::iter;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::ModError;
use crate::graph::DependencyGraph;
use crate::source::{Module, ModuleSource, SourceId};

/// Compiled modules keyed by source identity.
#[derive(Default)]
pub struct ModuleCache {
    modules: Mutex<HashMap<SourceId, Module>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SourceId) -> Option<Module> {
        self.modules.lock().get(id).cloned()
    }

    /// Cache `module` unless another compile of `id` got there first; either
    /// way return the module that ends up cached.
    pub fn insert(&self, id: SourceId, module: Module) -> Module {
        self.modules.lock().entry(id).or_insert(module).clone()
    }

    /// Drop the cached module for `id`. Returns whether anything was cached.
    pub fn purge(&self, id: &SourceId) -> bool {
        self.modules.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.modules.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ModuleLoader {
    source: Arc<dyn ModuleSource>,
    cache: ModuleCache,
    graph: Mutex<DependencyGraph>,
}

impl ModuleLoader {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self {
            source,
            cache: ModuleCache::new(),
            graph: Mutex::new(DependencyGraph::new()),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<SourceId, ModError> {
        self.source.resolve(name)
    }

    /// Resolve `name` and return its module, compiling it on a cache miss.
    ///
    /// When `requester` is set, the edge `requester -> resolved id` is recorded
    /// before the lookup, so cache hits are tracked too.
    pub fn require(&self, requester: Option<&SourceId>, name: &str) -> Result<Module, ModError> {
        self.require_in(requester, name, &[])
    }

    fn require_in(
        &self,
        requester: Option<&SourceId>,
        name: &str,
        chain: &[SourceId],
    ) -> Result<Module, ModError> {
        let id = self.source.resolve(name)?;
        if let Some(requester) = requester {
            if self.graph.lock().record_edge(requester, &id) {
                trace!(loader = %requester, dependency = %id, "Recorded dependency edge");
            }
        }
        self.module_in(&id, chain)
    }

    /// Cached module for `id`, or a fresh compile.
    pub fn module(&self, id: &SourceId) -> Result<Module, ModError> {
        self.module_in(id, &[])
    }

    /// `chain` holds the identities whose compile is in progress further up
    /// this call stack. Compiles on other tasks never appear in it, so
    /// concurrent loads of unrelated mods sharing a dependency both succeed;
    /// the first compile to finish is the one cached.
    fn module_in(&self, id: &SourceId, chain: &[SourceId]) -> Result<Module, ModError> {
        if let Some(module) = self.cache.get(id) {
            return Ok(module);
        }
        if chain.contains(id) {
            return Err(ModError::Compile {
                id: id.to_string(),
                source: anyhow::anyhow!("circular require while '{id}' is still compiling"),
            });
        }

        let chain: Vec<SourceId> = chain.iter().cloned().chain(iter::once(id.clone())).collect();
        let requirer = Requirer {
            loader: self,
            id: id.clone(),
            chain,
        };
        let module = self
            .source
            .compile(id, &requirer)
            .map_err(|source| ModError::Compile {
                id: id.to_string(),
                source,
            })?;
        debug!(module = %id, "Compiled module");
        Ok(self.cache.insert(id.clone(), module))
    }

    /// Purge `name` and everything it transitively required.
    pub fn uncache(&self, name: &str) -> Result<Vec<SourceId>, ModError> {
        let id = self.source.resolve(name)?;
        Ok(self.purge_tree(&id))
    }

    /// Purge `id` plus its transitive dependencies from the cache and drop
    /// their outgoing edges. Returns every identity visited, root first.
    pub fn purge_tree(&self, id: &SourceId) -> Vec<SourceId> {
        let dependencies: Vec<SourceId> = {
            let graph = self.graph.lock();
            let mut walk = graph.transitive_dependencies(id);
            let reached: Vec<SourceId> = walk.by_ref().cloned().collect();
            if walk.revisits() > 0 {
                debug!(
                    module = %id,
                    skipped = walk.revisits(),
                    "Skipped already purged dependencies (cycle or shared dependency)"
                );
            }
            reached
        };

        let visited: Vec<SourceId> = iter::once(id.clone()).chain(dependencies).collect();
        let mut graph = self.graph.lock();
        for target in &visited {
            if self.cache.purge(target) {
                trace!(module = %target, "Purged cached module");
            }
            graph.forget(target);
        }
        visited
    }

    pub fn is_cached(&self, id: &SourceId) -> bool {
        self.cache.contains(id)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Run `f` against the dependency graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&DependencyGraph) -> R) -> R {
        f(&self.graph.lock())
    }
}

/// Require handle bound to the identity doing the requiring.
pub struct Requirer<'a> {
    loader: &'a ModuleLoader,
    id: SourceId,
    chain: Vec<SourceId>,
}

impl<'a> Requirer<'a> {

    /// Identity the recorded edges are keyed by.
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn require(&self, name: &str) -> Result<Module, ModError> {
        self.loader.require_in(Some(&self.id), name, &self.chain)
    }

    pub fn require_library<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ModError> {
        downcast_library(name, self.require(name)?)
    }
}

pub(crate) fn downcast_library<T: Any + Send + Sync>(
    name: &str,
    module: Module,
) -> Result<Arc<T>, ModError> {
    match module {
        Module::Library(value) => value.downcast::<T>().map_err(|_| ModError::LibraryType {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        }),
        Module::Entry(_) => Err(ModError::NotALibrary(name.to_string())),
    }
}
