//! Mod Instance
//!
//! The live handle for one loaded mod: its event bus, its timers, its teardown
//! hook and a weak link back to the registry for broadcasting. Mod code sees it
//! through [`ModContext`].

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ModError;
use crate::event_bus::{BEFORE_UNLOAD, EmitReport, EventBus, panic_message};
use crate::loader::{ModuleLoader, downcast_library};
use crate::registry::Registry;
use crate::source::{Module, SourceId, Teardown};
use crate::tracker::{IntervalHandle, ResourceTracker, TimerHandle};

/// Nested broadcasts allowed on one thread before further deliveries are
/// dropped. Handlers that broadcast to each other would otherwise recurse
/// until the stack overflows.
pub const MAX_BROADCAST_DEPTH: usize = 32;

/// Broadcasts a single top-level broadcast may fan out into, counted across
/// every nesting level.
pub const MAX_NESTED_BROADCASTS: usize = 1024;

thread_local! {
    static BROADCAST_DEPTH: Cell<usize> = const { Cell::new(0) };
    static NESTED_BROADCASTS: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        let depth = BROADCAST_DEPTH.with(Cell::get);
        let nested = if depth == 0 {
            0
        } else {
            NESTED_BROADCASTS.with(Cell::get)
        };
        if depth >= MAX_BROADCAST_DEPTH || nested >= MAX_NESTED_BROADCASTS {
            return None;
        }
        BROADCAST_DEPTH.with(|cell| cell.set(depth + 1));
        NESTED_BROADCASTS.with(|cell| cell.set(nested + 1));
        Some(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        BROADCAST_DEPTH.with(|cell| cell.set(cell.get().saturating_sub(1)));
    }
}

/// Emit `event` on every target's bus. Returns `None`, delivering nothing,
/// when the broadcast is nested deeper than [`MAX_BROADCAST_DEPTH`] or its
/// top-level broadcast has used up [`MAX_NESTED_BROADCASTS`].
pub(crate) fn deliver_broadcast(
    targets: &[Arc<ModInstance>],
    event: &str,
    args: &[Value],
) -> Option<EmitReport> {
    let Some(_guard) = DepthGuard::enter() else {
        warn!(event, max_depth = MAX_BROADCAST_DEPTH, "Broadcast loop detected, delivery dropped");
        return None;
    };
    Some(
        targets
            .iter()
            .map(|target| target.bus.emit(event, args))
            .fold(EmitReport::default(), EmitReport::merge),
    )
}

/// Host-supplied value every mod can read during and after init.
pub type HostContext = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a mod instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModState {
    Loading,
    Active,
    Unloading,
    Unloaded,
}

impl ModState {
    /// Loading and active instances receive events and may schedule timers.
    pub fn is_live(self) -> bool {
        matches!(self, ModState::Loading | ModState::Active)
    }
}

impl fmt::Display for ModState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModState::Loading => "loading",
            ModState::Active => "active",
            ModState::Unloading => "unloading",
            ModState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

pub struct ModInstance {
    name: String,
    source_id: SourceId,
    generation: u64,
    state: RwLock<ModState>,
    bus: EventBus,
    tracker: Arc<ResourceTracker>,
    teardown: Mutex<Option<Teardown>>,
    registry: Weak<Registry>,
    loader: Weak<ModuleLoader>,
    host: HostContext,
}

impl ModInstance {
    pub(crate) fn new(
        name: &str,
        source_id: SourceId,
        generation: u64,
        registry: &Arc<Registry>,
        loader: &Arc<ModuleLoader>,
        host: HostContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source_id,
            generation,
            state: RwLock::new(ModState::Loading),
            bus: EventBus::new(name),
            tracker: ResourceTracker::new(name),
            teardown: Mutex::new(None),
            registry: Arc::downgrade(registry),
            loader: Arc::downgrade(loader),
            host,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// How many times this mod name has been loaded by the manager, this
    /// instance included.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ModState {
        *self.state.read()
    }

    /// The host context, if it has type `T`.
    pub fn host<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.host.downcast_ref::<T>()
    }

    // -- events -------------------------------------------------------------

    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> usize
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.on(event, handler)
    }

    /// Emit to this mod's own subscribers only.
    pub fn emit(&self, event: &str, args: &[Value]) -> EmitReport {
        self.bus.emit(event, args)
    }

    /// Deliver `event` to every live mod, this one included, in load order.
    /// Returns how many mods it was delivered to.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let targets = registry.live();
        let Some(report) = deliver_broadcast(&targets, event, args) else {
            return 0;
        };
        debug!(
            from = %self.name,
            event,
            mods = targets.len(),
            handlers = report.invoked,
            failed = report.failed,
            "Broadcast delivered"
        );
        targets.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.bus.listener_count(event)
    }

    // -- timers -------------------------------------------------------------

    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, ModError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_live()?;
        self.tracker.set_timeout(delay, callback)
    }

    pub fn set_interval<F>(&self, period: Duration, callback: F) -> Result<IntervalHandle, ModError>
    where
        F: FnMut() + Send + 'static,
    {
        self.ensure_live()?;
        self.tracker.set_interval(period, callback)
    }

    pub fn clear_timeout(&self, handle: TimerHandle) -> bool {
        self.tracker.clear_timeout(handle)
    }

    pub fn clear_interval(&self, handle: IntervalHandle) -> bool {
        self.tracker.clear_interval(handle)
    }

    pub fn active_timers(&self) -> usize {
        self.tracker.active_count()
    }

    fn ensure_live(&self) -> Result<(), ModError> {
        if self.state().is_live() {
            Ok(())
        } else {
            Err(ModError::ResourcesClosed(self.name.clone()))
        }
    }

    // -- dependencies -------------------------------------------------------

    /// Require another module. The edge is recorded against this mod's source
    /// identity, so reloading this mod also purges what it pulled in.
    pub fn require(&self, name: &str) -> Result<Module, ModError> {
        let loader = self
            .loader
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("mod host has been dropped"))?;
        loader.require(Some(&self.source_id), name)
    }

    pub fn require_library<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ModError> {
        downcast_library(name, self.require(name)?)
    }

    // -- lifecycle (driven by the manager) ----------------------------------

    pub(crate) fn set_state(&self, state: ModState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        debug!(mod_name = %self.name, from = %previous, to = %state, "Mod state changed");
    }

    pub(crate) fn activate(&self, teardown: Teardown) {
        *self.teardown.lock() = Some(teardown);
        self.set_state(ModState::Active);
    }

    /// Unload protocol. The order is fixed: tell subscribers, detach them,
    /// cancel timers, then await the teardown hook.
    pub(crate) async fn unload(&self, is_reloading: bool) -> anyhow::Result<()> {
        self.set_state(ModState::Unloading);
        self.bus.emit(BEFORE_UNLOAD, &[Value::Bool(is_reloading)]);
        let listeners = self.bus.remove_all_listeners();
        let timers = self.tracker.cancel_all();
        debug!(
            mod_name = %self.name,
            listeners,
            timers,
            is_reloading,
            "Released mod resources"
        );

        let teardown = self.teardown.lock().take().unwrap_or_default();
        let result = match AssertUnwindSafe(teardown.run(is_reloading)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "teardown panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        self.set_state(ModState::Unloaded);
        result
    }

    /// Release whatever a failed init managed to register. No event is
    /// emitted and there is no teardown hook to run.
    pub(crate) fn abandon(&self) {
        self.set_state(ModState::Unloading);
        self.bus.remove_all_listeners();
        self.tracker.cancel_all();
        self.teardown.lock().take();
        self.set_state(ModState::Unloaded);
    }
}

impl fmt::Debug for ModInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModInstance")
            .field("name", &self.name)
            .field("source_id", &self.source_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Execution context handed to a mod's init. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ModContext {
    instance: Arc<ModInstance>,
}

impl ModContext {
    pub(crate) fn new(instance: Arc<ModInstance>) -> Self {
        Self { instance }
    }

    /// Weak handle for closures stored inside the mod itself (handlers,
    /// timers), so they do not keep the instance alive.
    pub fn downgrade(&self) -> Weak<ModInstance> {
        Arc::downgrade(&self.instance)
    }

    pub fn upgrade(weak: &Weak<ModInstance>) -> Option<Self> {
        weak.upgrade().map(Self::new)
    }

    pub fn instance(&self) -> &Arc<ModInstance> {
        &self.instance
    }

    pub fn same_instance(&self, other: &ModContext) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl Deref for ModContext {
    type Target = ModInstance;

    fn deref(&self) -> &ModInstance {
        &self.instance
    }
}
