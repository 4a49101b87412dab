//! Mod lifecycle manager: load, unload, reload and cache purges across the
//! set of loaded mods.
//!
//! Operations on different mods run concurrently. Operations on the same mod
//! are serialized by a per-name async lock, which keeps at most one live
//! instance per name: an unload issued while a load is still initializing
//! waits for that init to settle, and a reload finishes its unload before it
//! purges and finishes the purge before it loads again.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use modhost_logging::{LifecycleEvent, LifecycleLogger};

use crate::error::ModError;
use crate::event_bus::panic_message;
use crate::instance::{HostContext, ModContext, ModInstance, ModState, deliver_broadcast};
use crate::loader::ModuleLoader;
use crate::registry::Registry;
use crate::source::{Module, ModDiscovery, ModuleSource, SourceId};

/// Result of unloading one mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded,
    /// The name was not loaded; nothing happened.
    NotLoaded,
}

/// Per-item results of a batch operation, in input order. One failing item
/// never stops the others.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<(String, Result<T, ModError>)>,
}

impl<T> BatchReport<T> {
    fn new(results: Vec<(String, Result<T, ModError>)>) -> Self {
        Self { results }
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &T)> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.as_ref().ok().map(|value| (name.as_str(), value)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ModError)> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.as_ref().err().map(|err| (name.as_str(), err)))
    }

    pub fn get(&self, name: &str) -> Option<&Result<T, ModError>> {
        self.results
            .iter()
            .find(|(item, _)| item == name)
            .map(|(_, result)| result)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

struct ManagerInner {
    registry: Arc<Registry>,
    loader: Arc<ModuleLoader>,
    discovery: Arc<dyn ModDiscovery>,
    host: HostContext,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    loading: Mutex<HashSet<String>>,
    generations: Mutex<HashMap<String, u64>>,
}

/// Marks a name as having a load in flight until dropped.
struct LoadClaim<'a> {
    loading: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        self.loading.lock().remove(&self.name);
    }
}

/// Handle to the lifecycle manager. Clones share the same registry.
#[derive(Clone)]
pub struct ModManager {
    inner: Arc<ManagerInner>,
}

impl ModManager {
    pub fn new(source: Arc<dyn ModuleSource>, discovery: Arc<dyn ModDiscovery>) -> Self {
        Self::with_host(source, discovery, Arc::new(()))
    }

    /// Like [`ModManager::new`], with a host context every mod can read.
    pub fn with_host(
        source: Arc<dyn ModuleSource>,
        discovery: Arc<dyn ModDiscovery>,
        host: HostContext,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Arc::new(Registry::new()),
                loader: Arc::new(ModuleLoader::new(source)),
                discovery,
                host,
                op_locks: Mutex::new(HashMap::new()),
                loading: Mutex::new(HashSet::new()),
                generations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Use one value as both module source and discovery.
    pub fn from_source<S>(source: Arc<S>) -> Self
    where
        S: ModuleSource + ModDiscovery + 'static,
    {
        Self::new(source.clone(), source)
    }

    // -- single-item operations ---------------------------------------------

    /// Load one mod and return its context once init has completed.
    pub async fn load(&self, name: &str) -> Result<ModContext, ModError> {
        let _claim = self.claim_load(name)?;
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        if self.inner.registry.contains(name) {
            return Err(ModError::AlreadyLoaded(name.to_string()));
        }
        self.load_locked(name).await
    }

    /// Unload one mod. A name that is not loaded is a no-op.
    pub async fn unload(&self, name: &str, is_reloading: bool) -> Result<UnloadOutcome, ModError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.unload_locked(name, is_reloading).await
    }

    /// Unload (flagged as reloading), purge the mod and everything it pulled
    /// in, then load it again from fresh source. A name that was not loaded is
    /// simply loaded.
    pub async fn reload(&self, name: &str) -> Result<ModContext, ModError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        if let Err(e) = self.unload_locked(name, true).await {
            warn!(mod_name = %name, error = %e, "Teardown failed during reload; loading fresh instance anyway");
        }

        let purged = self.inner.loader.uncache(name)?;
        LifecycleLogger::record(LifecycleEvent::Purged {
            mod_name: name.to_string(),
            modules: purged.iter().map(SourceId::to_string).collect(),
        });

        let ctx = self.load_locked(name).await?;
        LifecycleLogger::record(LifecycleEvent::Reloaded {
            mod_name: name.to_string(),
            generation: ctx.generation(),
        });
        Ok(ctx)
    }

    /// Purge the cached source of `name` and of everything it transitively
    /// required. Loaded instances keep running on the code they were built from.
    pub fn uncache(&self, name: &str) -> Result<Vec<SourceId>, ModError> {
        let purged = self.inner.loader.uncache(name)?;
        debug!(mod_name = %name, purged = purged.len(), "Purged module cache");
        Ok(purged)
    }

    // -- batch operations ---------------------------------------------------

    pub async fn load_many<I, S>(&self, names: I) -> BatchReport<ModContext>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let results = join_all(names.iter().map(|name| self.load(name))).await;
        BatchReport::new(names.into_iter().zip(results).collect())
    }

    pub async fn unload_many<I, S>(&self, names: I, is_reloading: bool) -> BatchReport<UnloadOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let results = join_all(names.iter().map(|name| self.unload(name, is_reloading))).await;
        BatchReport::new(names.into_iter().zip(results).collect())
    }

    pub async fn reload_many<I, S>(&self, names: I) -> BatchReport<ModContext>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let results = join_all(names.iter().map(|name| self.reload(name))).await;
        BatchReport::new(names.into_iter().zip(results).collect())
    }

    /// Unload every loaded mod concurrently.
    pub async fn unload_all(&self, is_reloading: bool) -> BatchReport<UnloadOutcome> {
        let names = self.inner.registry.names();
        info!(count = names.len(), "Unloading all mods");
        self.unload_many(names, is_reloading).await
    }

    pub async fn reload_all(&self) -> BatchReport<ModContext> {
        let names = self.inner.registry.names();
        info!(count = names.len(), "Reloading all mods");
        self.reload_many(names).await
    }

    /// Discover every available mod and load them concurrently.
    pub async fn autoload(&self) -> Result<BatchReport<ModContext>, ModError> {
        let names = self.inner.discovery.discover().map_err(ModError::Discovery)?;
        info!(count = names.len(), "Autoloading mods");
        let report = self.load_many(names).await;
        for (name, err) in report.failures() {
            warn!(mod_name = %name, error = %err, "Autoload failed for mod");
        }
        Ok(report)
    }

    /// Names available for autoload.
    pub fn discover(&self) -> Result<Vec<String>, ModError> {
        self.inner.discovery.discover().map_err(ModError::Discovery)
    }

    /// Deliver `event` from the host to every live mod, in load order.
    /// Returns how many mods it was delivered to.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        let targets = self.inner.registry.live();
        let Some(report) = deliver_broadcast(&targets, event, args) else {
            return 0;
        };
        debug!(
            event,
            mods = targets.len(),
            handlers = report.invoked,
            failed = report.failed,
            "Host broadcast delivered"
        );
        targets.len()
    }

    // -- inspection ---------------------------------------------------------

    /// Whether `name` has an active instance.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.state_of(name) == Some(ModState::Active)
    }

    pub fn get(&self, name: &str) -> Option<ModContext> {
        self.inner.registry.get(name).map(ModContext::new)
    }

    pub fn state_of(&self, name: &str) -> Option<ModState> {
        self.inner.registry.get(name).map(|instance| instance.state())
    }

    /// Registered names in load order.
    pub fn loaded_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.inner.loader
    }

    // -- internals ----------------------------------------------------------

    fn claim_load(&self, name: &str) -> Result<LoadClaim<'_>, ModError> {
        if !self.inner.loading.lock().insert(name.to_string()) {
            return Err(ModError::AlreadyLoading(name.to_string()));
        }
        Ok(LoadClaim {
            loading: &self.inner.loading,
            name: name.to_string(),
        })
    }

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .op_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn next_generation(&self, name: &str) -> u64 {
        let mut generations = self.inner.generations.lock();
        let generation = generations.entry(name.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Caller holds the op lock for `name`.
    async fn load_locked(&self, name: &str) -> Result<ModContext, ModError> {
        let started = Instant::now();
        let inner = &self.inner;

        let id = inner.loader.resolve(name)?;
        let entry = match inner.loader.module(&id)? {
            Module::Entry(entry) => entry,
            Module::Library(_) => {
                return Err(ModError::LoadFailure {
                    name: name.to_string(),
                    source: anyhow::anyhow!("'{id}' is a library, not a mod"),
                });
            }
        };

        let generation = self.next_generation(name);
        let instance = ModInstance::new(
            name,
            id,
            generation,
            &inner.registry,
            &inner.loader,
            inner.host.clone(),
        );
        // Registered before init runs so broadcasts during init can reach it.
        inner.registry.insert(instance.clone());
        debug!(mod_name = %name, generation, "Initializing mod");

        let ctx = ModContext::new(instance.clone());
        let init = AssertUnwindSafe(entry.init(ctx.clone())).catch_unwind().await;
        let result = match init {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "init panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        match result {
            Ok(teardown) => {
                instance.activate(teardown);
                LifecycleLogger::record(LifecycleEvent::Loaded {
                    mod_name: name.to_string(),
                    generation,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(ctx)
            }
            Err(source) => {
                instance.abandon();
                inner.registry.remove_instance(&instance);
                LifecycleLogger::record(LifecycleEvent::LoadFailed {
                    mod_name: name.to_string(),
                    error: format!("{source:#}"),
                });
                Err(ModError::LoadFailure {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Caller holds the op lock for `name`.
    async fn unload_locked(&self, name: &str, is_reloading: bool) -> Result<UnloadOutcome, ModError> {
        let Some(instance) = self.inner.registry.get(name) else {
            debug!(mod_name = %name, "Unload requested for a mod that is not loaded");
            return Ok(UnloadOutcome::NotLoaded);
        };

        let result = instance.unload(is_reloading).await;
        // Removed even when teardown failed: its resources are already gone.
        self.inner.registry.remove_instance(&instance);

        match result {
            Ok(()) => {
                LifecycleLogger::record(LifecycleEvent::Unloaded {
                    mod_name: name.to_string(),
                    is_reloading,
                });
                Ok(UnloadOutcome::Unloaded)
            }
            Err(source) => {
                LifecycleLogger::record(LifecycleEvent::UnloadFailed {
                    mod_name: name.to_string(),
                    error: format!("{source:#}"),
                });
                Err(ModError::UnloadFailure {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, Teardown, entry_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with(source: MemorySource) -> (Arc<MemorySource>, ModManager) {
        let source = Arc::new(source);
        let manager = ModManager::from_source(source.clone());
        (source, manager)
    }

    fn noop_entry() -> Arc<dyn crate::source::ModEntry> {
        entry_fn(|_ctx| async { Ok(Teardown::none()) })
    }

    #[tokio::test]
    async fn test_load_registers_active_instance() {
        let source = MemorySource::new();
        source.register_entry("greeter", noop_entry());
        let (_source, manager) = manager_with(source);

        let ctx = manager.load("greeter").await.unwrap();
        assert_eq!(ctx.state(), ModState::Active);
        assert_eq!(ctx.generation(), 1);
        assert!(manager.is_loaded("greeter"));
        assert_eq!(manager.loaded_names(), vec!["greeter".to_string()]);
    }

    #[tokio::test]
    async fn test_loading_twice_is_rejected() {
        let source = MemorySource::new();
        source.register_entry("once", noop_entry());
        let (_source, manager) = manager_with(source);

        manager.load("once").await.unwrap();
        assert!(matches!(
            manager.load("once").await,
            Err(ModError::AlreadyLoaded(name)) if name == "once"
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_no_entry() {
        let source = MemorySource::new();
        source.register_entry(
            "broken",
            entry_fn(|ctx| async move {
                ctx.on("never", |_| Ok(()));
                ctx.set_interval(std::time::Duration::from_millis(5), || {})?;
                anyhow::bail!("missing credentials")
            }),
        );
        let (_source, manager) = manager_with(source);

        let err = manager.load("broken").await.unwrap_err();
        assert!(matches!(err, ModError::LoadFailure { ref name, .. } if name == "broken"));
        assert!(err.to_string().contains("missing credentials"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_init_panic_is_a_load_failure() {
        let source = MemorySource::new();
        source.register_entry("panics", entry_fn(|_ctx| async { panic!("init exploded") }));
        let (_source, manager) = manager_with(source);

        let err = manager.load("panics").await.unwrap_err();
        assert!(err.to_string().contains("init exploded"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_is_noop() {
        let (_source, manager) = manager_with(MemorySource::new());
        assert_eq!(
            manager.unload("ghost", false).await.unwrap(),
            UnloadOutcome::NotLoaded
        );
    }

    #[tokio::test]
    async fn test_teardown_failure_still_removes_instance() {
        let source = MemorySource::new();
        source.register_entry(
            "stubborn",
            entry_fn(|_ctx| async {
                Ok(Teardown::blocking(|_| anyhow::bail!("flush failed")))
            }),
        );
        let (_source, manager) = manager_with(source);
        let ctx = manager.load("stubborn").await.unwrap();

        let err = manager.unload("stubborn", false).await.unwrap_err();
        assert!(matches!(err, ModError::UnloadFailure { .. }));
        assert!(!manager.is_loaded("stubborn"));
        assert_eq!(ctx.state(), ModState::Unloaded);
    }

    #[tokio::test]
    async fn test_loading_a_library_fails() {
        let source = MemorySource::new();
        source.register_library("shared", 5u8);
        let (_source, manager) = manager_with(source);
        assert!(matches!(
            manager.load("shared").await,
            Err(ModError::LoadFailure { .. })
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_name() {
        let (_source, manager) = manager_with(MemorySource::new());
        assert!(matches!(
            manager.load("nowhere").await,
            Err(ModError::Unresolved(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let source = MemorySource::new();
        source.register_entry("good", noop_entry());
        source.register_entry("bad", entry_fn(|_ctx| async { anyhow::bail!("nope") }));
        let (_source, manager) = manager_with(source);

        let report = manager.load_many(["good", "bad", "missing"]).await;
        assert_eq!(report.len(), 3);
        assert!(!report.is_success());
        assert_eq!(report.succeeded().count(), 1);
        let failed: Vec<&str> = report.failures().map(|(name, _)| name).collect();
        assert_eq!(failed, vec!["bad", "missing"]);
        assert!(matches!(report.get("good"), Some(Ok(_))));
        assert_eq!(manager.loaded_names(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_reload_passes_reloading_flag() {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let source = MemorySource::new();
        let seen = flags.clone();
        source.register_entry(
            "flagged",
            entry_fn(move |_ctx| {
                let seen = seen.clone();
                async move {
                    Ok(Teardown::blocking(move |is_reloading| {
                        seen.lock().push(is_reloading);
                        Ok(())
                    }))
                }
            }),
        );
        let (_source, manager) = manager_with(source);

        manager.load("flagged").await.unwrap();
        let fresh = manager.reload("flagged").await.unwrap();
        assert_eq!(fresh.generation(), 2);
        manager.unload("flagged", false).await.unwrap();
        assert_eq!(*flags.lock(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_reload_of_unloaded_name_loads_it() {
        let source = MemorySource::new();
        source.register_entry("late", noop_entry());
        let (_source, manager) = manager_with(source);

        manager.reload("late").await.unwrap();
        assert!(manager.is_loaded("late"));
    }

    #[tokio::test]
    async fn test_host_broadcast_reaches_every_mod() {
        let hits = Arc::new(AtomicUsize::new(0));
        let source = MemorySource::new();
        for name in ["left", "right"] {
            let hits = hits.clone();
            source.register_entry(
                name,
                entry_fn(move |ctx| {
                    let hits = hits.clone();
                    async move {
                        ctx.on("refresh", move |_| {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        Ok(Teardown::none())
                    }
                }),
            );
        }
        let (_source, manager) = manager_with(source);
        manager.load_many(["left", "right"]).await;

        assert_eq!(manager.broadcast("refresh", &[]), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_host_context_reaches_mods() {
        let source = Arc::new(MemorySource::new());
        let observed = Arc::new(AtomicUsize::new(0));
        let sink = observed.clone();
        source.register_entry(
            "reader",
            entry_fn(move |ctx| {
                let sink = sink.clone();
                async move {
                    let port = ctx.host::<u16>().copied().unwrap_or_default();
                    sink.store(port as usize, Ordering::SeqCst);
                    Ok(Teardown::none())
                }
            }),
        );
        let manager = ModManager::with_host(source.clone(), source, Arc::new(8080u16));

        manager.load("reader").await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 8080);
    }
}
