//! Lifecycle Event Logger
//!
//! Structured records of mod loads, unloads, reloads and cache purges, written
//! through `tracing` on a dedicated target so they can be filtered or routed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Tracing target of the lifecycle audit trail.
pub const LIFECYCLE_TARGET: &str = "mod_lifecycle";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Loaded {
        mod_name: String,
        generation: u64,
        duration_ms: u64,
    },
    LoadFailed {
        mod_name: String,
        error: String,
    },
    Unloaded {
        mod_name: String,
        is_reloading: bool,
    },
    UnloadFailed {
        mod_name: String,
        error: String,
    },
    Purged {
        mod_name: String,
        modules: Vec<String>,
    },
    Reloaded {
        mod_name: String,
        generation: u64,
    },
}

impl LifecycleEvent {
    pub fn mod_name(&self) -> &str {
        match self {
            LifecycleEvent::Loaded { mod_name, .. }
            | LifecycleEvent::LoadFailed { mod_name, .. }
            | LifecycleEvent::Unloaded { mod_name, .. }
            | LifecycleEvent::UnloadFailed { mod_name, .. }
            | LifecycleEvent::Purged { mod_name, .. }
            | LifecycleEvent::Reloaded { mod_name, .. } => mod_name,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::LoadFailed { .. } | LifecycleEvent::UnloadFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
}

pub struct LifecycleLogger;

impl LifecycleLogger {
    /// Record a lifecycle event. Failures log at `warn`, everything else at `info`.
    pub fn record(event: LifecycleEvent) -> LifecycleLogEntry {
        let entry = LifecycleLogEntry {
            timestamp: Utc::now(),
            event,
        };
        let line = serde_json::to_string(&entry).unwrap_or_else(|_| format!("{:?}", entry));
        let mod_name = entry.event.mod_name();
        if entry.event.is_failure() {
            warn!(target: LIFECYCLE_TARGET, mod_name, entry = %line, "Mod lifecycle failure");
        } else {
            info!(target: LIFECYCLE_TARGET, mod_name, entry = %line, "Mod lifecycle event");
        }
        entry
    }
}
