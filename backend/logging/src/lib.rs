//! Telemetry and structured logging for the mod host.
//!
//! Handles subscriber setup (console plus rolling NDJSON file) and the
//! lifecycle audit trail emitted by the mod manager.

pub mod event_logger;
pub mod logger;

pub use event_logger::{LIFECYCLE_TARGET, LifecycleEvent, LifecycleLogEntry, LifecycleLogger};
pub use logger::init_logger;
