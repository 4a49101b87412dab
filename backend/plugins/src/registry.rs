/// Mod registry: the loaded instances, keyed by mod name, in load order.
///
/// The registry is owned by the lifecycle manager. Instances only hold a weak
/// reference to it, which they use to broadcast.
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::instance::{ModInstance, ModState};

#[derive(Default)]
pub struct Registry {
    mods: RwLock<IndexMap<String, Arc<ModInstance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `instance` under its name. Returns the instance it displaced, if any.
    pub fn insert(&self, instance: Arc<ModInstance>) -> Option<Arc<ModInstance>> {
        self.mods
            .write()
            .insert(instance.name().to_string(), instance)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModInstance>> {
        self.mods.read().get(name).cloned()
    }

    /// Remove `name`, keeping the relative order of the remaining entries.
    pub fn remove(&self, name: &str) -> Option<Arc<ModInstance>> {
        self.mods.write().shift_remove(name)
    }

    /// Remove `name` only if it still maps to `instance`.
    pub fn remove_instance(&self, instance: &Arc<ModInstance>) -> bool {
        let mut mods = self.mods.write();
        match mods.get(instance.name()) {
            Some(current) if Arc::ptr_eq(current, instance) => {
                mods.shift_remove(instance.name());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mods.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.mods.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.read().is_empty()
    }

    /// Instances that still accept events (loading or active), in load order.
    pub fn live(&self) -> Vec<Arc<ModInstance>> {
        self.mods
            .read()
            .values()
            .filter(|instance| instance.state().is_live())
            .cloned()
            .collect()
    }

    pub fn with_state(&self, state: ModState) -> Vec<String> {
        self.mods
            .read()
            .values()
            .filter(|instance| instance.state() == state)
            .map(|instance| instance.name().to_string())
            .collect()
    }
}
