//! Shutdown Coordination
//!
//! Maps process exit paths (signals, host task faults, an explicit request)
//! onto a single bulk unload. Only the first trigger wins; the bulk unload
//! runs at most once per coordinator.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::event_bus::panic_message;
use crate::lifecycle::ModManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS signal such as SIGINT or SIGTERM.
    Signal(String),
    /// A host task returned an error or panicked.
    Fault(String),
    /// The operator asked for it.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {name}"),
            ShutdownReason::Fault(message) => write!(f, "fault: {message}"),
            ShutdownReason::Requested => f.write_str("requested"),
        }
    }
}

struct CoordinatorInner {
    reason: watch::Sender<Option<ShutdownReason>>,
    cleaned_up: AtomicBool,
}

/// Cloneable handle; every clone observes the same trigger.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                reason,
                cleaned_up: AtomicBool::new(false),
            }),
        }
    }

    /// Request shutdown. Returns `false` when shutdown was already triggered.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let message = reason.to_string();
        let first = self.inner.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            info!(reason = %message, "Shutdown triggered");
        } else {
            warn!(reason = %message, "Shutdown already in progress");
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.reason.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason.borrow().clone()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.inner.reason.subscribe();
        if rx.wait_for(Option::is_some).await.is_err() {
            return ShutdownReason::Requested;
        }
        let reason = rx.borrow().clone();
        reason.unwrap_or(ShutdownReason::Requested)
    }

    /// Wait for the trigger, then unload every mod. The unload happens once
    /// even if `run` is called from several places.
    pub async fn run(&self, manager: &ModManager) -> ShutdownReason {
        let reason = self.wait().await;
        if self.inner.cleaned_up.swap(true, Ordering::AcqRel) {
            return reason;
        }

        info!(reason = %reason, mods = manager.len(), "Unloading mods before exit");
        let report = manager.unload_all(false).await;
        for (name, err) in report.failures() {
            warn!(mod_name = %name, error = %err, "Mod failed to unload cleanly during shutdown");
        }
        info!(unloaded = report.succeeded().count(), "Shutdown cleanup finished");
        reason
    }

    /// Trigger on SIGINT, SIGTERM or SIGHUP (ctrl-c on other platforms).
    pub fn listen_for_signals(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let signals = [
                (SignalKind::interrupt(), "SIGINT"),
                (SignalKind::terminate(), "SIGTERM"),
                (SignalKind::hangup(), "SIGHUP"),
            ];
            for (kind, name) in signals {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    match signal(kind) {
                        Ok(mut stream) => {
                            while stream.recv().await.is_some() {
                                coordinator.trigger(ShutdownReason::Signal(name.to_string()));
                            }
                        }
                        Err(e) => warn!(signal = name, error = %e, "Failed to install signal handler"),
                    }
                });
            }
        }

        #[cfg(not(unix))]
        {
            let coordinator = self.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    coordinator.trigger(ShutdownReason::Signal("ctrl-c".to_string()));
                }
            });
        }
    }

    /// Watch a host task. An error or a panic triggers a
    /// [`ShutdownReason::Fault`]; a clean finish triggers nothing.
    pub fn supervise<T>(&self, name: &'static str, task: JoinHandle<anyhow::Result<T>>) -> JoinHandle<()>
    where
        T: Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let fault = match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(format!("{name}: {e:#}")),
                Err(join) if join.is_cancelled() => None,
                Err(join) => match join.try_into_panic() {
                    Ok(payload) => Some(format!("{name} panicked: {}", panic_message(payload.as_ref()))),
                    Err(join) => Some(format!("{name}: {join}")),
                },
            };
            if let Some(message) = fault {
                error!(task = name, fault = %message, "Host task failed");
                coordinator.trigger(ShutdownReason::Fault(message));
            }
        })
    }
}
