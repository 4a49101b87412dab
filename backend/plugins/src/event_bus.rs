//! Event Bus
//!
//! Per-mod publish-subscribe. Handlers for an event run synchronously in
//! registration order; a failing or panicking handler is logged and the rest
//! still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

/// Lifecycle event emitted to a mod's own subscribers right before teardown.
/// Its single argument is the `is_reloading` flag.
pub const BEFORE_UNLOAD: &str = "beforeUnload";

pub type Handler = Arc<dyn Fn(&[Value]) -> Result<()> + Send + Sync>;

/// Outcome of one [`EventBus::emit`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    pub invoked: usize,
    pub failed: usize,
}

impl EmitReport {
    pub fn merge(self, other: EmitReport) -> EmitReport {
        EmitReport {
            invoked: self.invoked + other.invoked,
            failed: self.failed + other.failed,
        }
    }
}

pub struct EventBus {
    owner: String,
    listeners: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` to `event`. Returns the event's listener count.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> usize
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        let chain = listeners.entry(event.into()).or_default();
        chain.push(Arc::new(handler));
        chain.len()
    }

    /// Invoke every handler for `event`.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// emit re-entrantly. Subscriptions added during emission take effect on
    /// the next emit.
    pub fn emit(&self, event: &str, args: &[Value]) -> EmitReport {
        let chain: Vec<Handler> = match self.listeners.read().get(event) {
            Some(chain) => chain.clone(),
            None => return EmitReport::default(),
        };

        let mut report = EmitReport::default();
        for (index, handler) in chain.iter().enumerate() {
            report.invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        mod_name = %self.owner,
                        event,
                        handler = index,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    warn!(
                        mod_name = %self.owner,
                        event,
                        handler = index,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
        trace!(mod_name = %self.owner, event, invoked = report.invoked, "Event emitted");
        report
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    pub fn event_names(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    /// Detach every handler. Returns how many were removed.
    pub fn remove_all_listeners(&self) -> usize {
        let removed = std::mem::take(&mut *self.listeners.write());
        removed.values().map(Vec::len).sum()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
