pub mod directory;
pub mod error;
pub mod event_bus;
pub mod graph;
pub mod instance;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod shutdown;
pub mod source;
pub mod tracker;

pub use directory::DirectorySource;
pub use error::{ModError, ModResult};
pub use event_bus::{BEFORE_UNLOAD, EmitReport, EventBus};
pub use graph::DependencyGraph;
pub use instance::{
    HostContext, MAX_BROADCAST_DEPTH, MAX_NESTED_BROADCASTS, ModContext, ModInstance, ModState,
};
pub use lifecycle::{BatchReport, ModManager, UnloadOutcome};
pub use loader::{ModuleCache, ModuleLoader, Requirer};
pub use manifest::{Action, ModManifest, ScriptedMod};
pub use registry::Registry;
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use source::{
    MemorySource, ModDiscovery, ModEntry, Module, ModuleSource, SourceId, Teardown, entry_fn,
};
pub use tracker::{IntervalHandle, ResourceTracker, TimerHandle};
