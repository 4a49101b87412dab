/// Declarative mod manifest: a JSON description of what a mod does (event
/// handlers, timers, load/unload actions) that compiles into a [`ScriptedMod`].
///
/// A manifest with `"library": true` is not loadable on its own; other mods
/// pull it in through `requires` and read its `exports`.
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::instance::{ModContext, ModInstance};
use crate::source::{ModEntry, Teardown};

/// One step a scripted mod performs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Write a message to the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Broadcast this event to every live mod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    /// Broadcast arguments. When empty, the arguments that triggered the
    /// action are forwarded instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl Action {
    pub fn run(&self, instance: &ModInstance, incoming: &[Value]) {
        if let Some(message) = &self.log {
            info!(mod_name = %instance.name(), "{message}");
        }
        if let Some(event) = &self.broadcast {
            let args = if self.args.is_empty() { incoming } else { &self.args };
            instance.broadcast(event, args);
        }
    }

    fn is_empty(&self) -> bool {
        self.log.is_none() && self.broadcast.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSpec {
    pub every_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSpec {
    pub after_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub library: bool,
    /// Libraries this module depends on. Resolved when the manifest compiles.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub on: BTreeMap<String, Vec<Action>>,
    #[serde(default)]
    pub intervals: Vec<IntervalSpec>,
    #[serde(default)]
    pub timeouts: Vec<TimeoutSpec>,
    #[serde(default)]
    pub on_load: Vec<Action>,
    /// Run from the teardown hook; receives `[is_reloading]` as arguments.
    #[serde(default)]
    pub on_unload: Vec<Action>,
    /// Values a library hands to the mods that require it.
    #[serde(default)]
    pub exports: Value,
}

impl ModManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest for structural mistakes.
    pub fn validate(&self) -> Result<()> {
        if self.library {
            if !self.on.is_empty()
                || !self.intervals.is_empty()
                || !self.timeouts.is_empty()
                || !self.on_load.is_empty()
                || !self.on_unload.is_empty()
            {
                anyhow::bail!("library manifests cannot declare handlers, timers or actions");
            }
            return Ok(());
        }

        for (event, actions) in &self.on {
            if event.is_empty() {
                anyhow::bail!("event name in 'on' cannot be empty");
            }
            for action in actions {
                check_action(action, &format!("on.{event}"))?;
                if action.broadcast.as_deref() == Some(event.as_str()) {
                    anyhow::bail!("handler for '{event}' would re-broadcast '{event}' forever");
                }
            }
        }
        for (index, interval) in self.intervals.iter().enumerate() {
            if interval.every_ms == 0 {
                anyhow::bail!("intervals[{index}].everyMs must be greater than zero");
            }
            check_action(&interval.action, &format!("intervals[{index}]"))?;
        }
        for (index, timeout) in self.timeouts.iter().enumerate() {
            check_action(&timeout.action, &format!("timeouts[{index}]"))?;
        }
        for action in &self.on_load {
            check_action(action, "onLoad")?;
        }
        for action in &self.on_unload {
            check_action(action, "onUnload")?;
        }
        Ok(())
    }

    /// Library export under `key`, if this is an object export.
    pub fn export(&self, key: &str) -> Option<&Value> {
        self.exports.get(key)
    }
}

fn check_action(action: &Action, path: &str) -> Result<()> {
    if action.is_empty() {
        anyhow::bail!("{path}: action needs 'log' or 'broadcast'");
    }
    if matches!(&action.broadcast, Some(event) if event.is_empty()) {
        anyhow::bail!("{path}: broadcast event name cannot be empty");
    }
    Ok(())
}

/// A compiled declarative mod.
pub struct ScriptedMod {
    manifest: Arc<ModManifest>,
    libraries: Vec<(String, Arc<ModManifest>)>,
}

impl ScriptedMod {
    pub fn new(manifest: ModManifest, libraries: Vec<(String, Arc<ModManifest>)>) -> Self {
        Self {
            manifest: Arc::new(manifest),
            libraries,
        }
    }

    pub fn manifest(&self) -> &ModManifest {
        &self.manifest
    }

    /// Libraries linked at compile time, in `requires` order.
    pub fn libraries(&self) -> &[(String, Arc<ModManifest>)] {
        &self.libraries
    }
}

/// Run `actions` against the instance behind `weak`, if it is still around.
fn run_weak(weak: &Weak<ModInstance>, actions: &[Action], incoming: &[Value]) {
    if let Some(instance) = weak.upgrade() {
        for action in actions {
            action.run(&instance, incoming);
        }
    }
}

#[async_trait]
impl ModEntry for ScriptedMod {
    async fn init(&self, ctx: ModContext) -> Result<Teardown> {
        for (name, library) in &self.libraries {
            debug!(
                mod_name = %ctx.name(),
                library = %name,
                exports = %library.exports,
                "Linked library"
            );
        }

        for (event, actions) in &self.manifest.on {
            let weak = ctx.downgrade();
            let actions = actions.clone();
            ctx.on(event.clone(), move |args| {
                run_weak(&weak, &actions, args);
                Ok(())
            });
        }

        for interval in &self.manifest.intervals {
            let weak = ctx.downgrade();
            let action = interval.action.clone();
            ctx.set_interval(Duration::from_millis(interval.every_ms), move || {
                run_weak(&weak, std::slice::from_ref(&action), &[]);
            })?;
        }

        for timeout in &self.manifest.timeouts {
            let weak = ctx.downgrade();
            let action = timeout.action.clone();
            ctx.set_timeout(Duration::from_millis(timeout.after_ms), move || {
                run_weak(&weak, std::slice::from_ref(&action), &[]);
            })?;
        }

        for action in &self.manifest.on_load {
            action.run(&ctx, &[]);
        }

        if self.manifest.on_unload.is_empty() {
            return Ok(Teardown::none());
        }
        let weak = ctx.downgrade();
        let manifest = self.manifest.clone();
        Ok(Teardown::blocking(move |is_reloading| {
            run_weak(&weak, &manifest.on_unload, &[Value::Bool(is_reloading)]);
            Ok(())
        }))
    }
}
