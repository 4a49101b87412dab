//! Module source contract
//!
//! The boundary between the host and mod authors: how a name resolves to a
//! concrete source identity, how that source compiles into a [`Module`], and
//! what a mod's init entry point looks like.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::ModError;
use crate::instance::ModContext;
use crate::loader::Requirer;

/// Concrete identity a mod or library name resolves to (a file path, a
/// catalogue key). The module cache and dependency graph are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Teardown hook
// ---------------------------------------------------------------------------

type TeardownFn = Box<dyn FnOnce(bool) -> BoxFuture<'static, Result<()>> + Send>;

/// Cleanup hook returned by a mod's init. Invoked once at unload with the
/// `is_reloading` flag, after timers and listeners have been released.
pub struct Teardown(Option<TeardownFn>);

impl Teardown {
    /// No cleanup beyond what the host does itself.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Some(Box::new(move |is_reloading| Box::pin(hook(is_reloading)))))
    }

    pub fn blocking<F>(hook: F) -> Self
    where
        F: FnOnce(bool) -> Result<()> + Send + 'static,
    {
        Self::new(move |is_reloading| futures::future::ready(hook(is_reloading)))
    }

    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) async fn run(self, is_reloading: bool) -> Result<()> {
        match self.0 {
            Some(hook) => hook(is_reloading).await,
            None => Ok(()),
        }
    }
}

impl From<()> for Teardown {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Teardown")
            .field(&if self.is_some() { "hook" } else { "none" })
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Entry points and modules
// ---------------------------------------------------------------------------

/// Init entry point exposed by a mod.
#[async_trait]
pub trait ModEntry: Send + Sync {
    /// Wire up the mod using `ctx` and hand back its teardown hook.
    async fn init(&self, ctx: ModContext) -> Result<Teardown>;
}

/// Adapter turning an async closure into a [`ModEntry`].
pub struct FnEntry<F>(F);

#[async_trait]
impl<F, Fut> ModEntry for FnEntry<F>
where
    F: Fn(ModContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Teardown>> + Send,
{
    async fn init(&self, ctx: ModContext) -> Result<Teardown> {
        (self.0)(ctx).await
    }
}

pub fn entry_fn<F, Fut>(init: F) -> Arc<dyn ModEntry>
where
    F: Fn(ModContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Teardown>> + Send + 'static,
{
    Arc::new(FnEntry(init))
}

/// Compiled representation of one source identity, as held by the cache.
#[derive(Clone)]
pub enum Module {
    /// A loadable mod.
    Entry(Arc<dyn ModEntry>),
    /// A shared value other modules can require.
    Library(Arc<dyn Any + Send + Sync>),
}

impl Module {
    pub fn entry(entry: impl ModEntry + 'static) -> Self {
        Module::Entry(Arc::new(entry))
    }

    pub fn library<T: Any + Send + Sync>(value: T) -> Self {
        Module::Library(Arc::new(value))
    }

    pub fn is_library(&self) -> bool {
        matches!(self, Module::Library(_))
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Entry(_) => f.write_str("Module::Entry"),
            Module::Library(_) => f.write_str("Module::Library"),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Resolves names and compiles sources. Implemented by whatever stores mods.
pub trait ModuleSource: Send + Sync {
    fn resolve(&self, name: &str) -> Result<SourceId, ModError>;

    /// Build a fresh [`Module`] for `id`. Nested requires must go through
    /// `requirer` so the dependency graph sees them.
    fn compile(&self, id: &SourceId, requirer: &Requirer<'_>) -> Result<Module>;
}

/// Enumerates the mod names available for autoload.
pub trait ModDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory catalogue
// ---------------------------------------------------------------------------

type Factory = Arc<dyn Fn(&Requirer<'_>) -> Result<Module> + Send + Sync>;

/// A catalogue of compiled-in modules. Each compile calls the registered
/// factory again, so replacing a factory and reloading swaps the behaviour.
#[derive(Default)]
pub struct MemorySource {
    factories: RwLock<IndexMap<String, Factory>>,
    compiles: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the factory for `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Requirer<'_>) -> Result<Module> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn register_entry(&self, name: impl Into<String>, entry: Arc<dyn ModEntry>) {
        self.register(name, move |_| Ok(Module::Entry(entry.clone())));
    }

    pub fn register_library<T>(&self, name: impl Into<String>, value: T)
    where
        T: Any + Clone + Send + Sync,
    {
        self.register(name, move |_| Ok(Module::library(value.clone())));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.factories.write().shift_remove(name).is_some()
    }

    /// How many times any module was compiled. Cache hits do not count.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl ModuleSource for MemorySource {
    fn resolve(&self, name: &str) -> Result<SourceId, ModError> {
        if self.factories.read().contains_key(name) {
            Ok(SourceId::from(name))
        } else {
            Err(ModError::Unresolved(name.to_string()))
        }
    }

    fn compile(&self, id: &SourceId, requirer: &Requirer<'_>) -> Result<Module> {
        let factory = self
            .factories
            .read()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("module '{id}' was removed from the catalogue"))?;
        self.compiles.fetch_add(1, Ordering::SeqCst);
        factory(requirer)
    }
}

impl ModDiscovery for MemorySource {
    fn discover(&self) -> Result<Vec<String>> {
        Ok(self.factories.read().keys().cloned().collect())
    }
}
