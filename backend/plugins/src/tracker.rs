//! Resource Tracker
//!
//! Owns every timeout and interval a mod schedules so they can be force
//! cancelled at unload. Once [`ResourceTracker::cancel_all`] returns, no
//! callback from this tracker starts again.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::ModError;
use crate::event_bus::panic_message;

/// Shortest interval period accepted; tokio rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalHandle(u64);

/// Callback gate. Closing it waits for a callback already running on another
/// thread; a callback may close its own gate (the lock is reentrant).
struct Gate(ReentrantMutex<Cell<bool>>);

impl Gate {
    fn new() -> Self {
        Self(ReentrantMutex::new(Cell::new(true)))
    }

    /// Run `callback` unless the gate is closed. A panicking callback is
    /// logged and counts as having run.
    fn run_if_open(&self, owner: &str, callback: impl FnOnce()) -> bool {
        let open = self.0.lock();
        if !open.get() {
            return false;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            warn!(
                mod_name = %owner,
                panic = %panic_message(payload.as_ref()),
                "Timer callback panicked"
            );
        }
        true
    }

    fn close(&self) {
        self.0.lock().set(false);
    }
}

struct Tracked {
    gate: Arc<Gate>,
    task: AbortHandle,
}

impl Tracked {
    fn cancel(self) {
        self.gate.close();
        self.task.abort();
    }
}

#[derive(Default)]
struct TrackerState {
    closed: bool,
    timeouts: HashMap<u64, Tracked>,
    intervals: HashMap<u64, Tracked>,
}

pub struct ResourceTracker {
    owner: String,
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl ResourceTracker {
    pub fn new(owner: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.into(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Run `callback` once after `delay`.
    pub fn set_timeout<F>(self: &Arc<Self>, delay: Duration, callback: F) -> Result<TimerHandle, ModError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ModError::NoRuntime)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(ModError::ResourcesClosed(self.owner.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());
        let task_gate = gate.clone();
        let tracker: Weak<Self> = Arc::downgrade(self);
        let owner = self.owner.clone();
        let task = runtime.spawn(async move {
            time::sleep(delay).await;
            task_gate.run_if_open(&owner, callback);
            if let Some(tracker) = tracker.upgrade() {
                tracker.state.lock().timeouts.remove(&id);
            }
        });

        state.timeouts.insert(
            id,
            Tracked {
                gate,
                task: task.abort_handle(),
            },
        );
        trace!(owner = %self.owner, timer = id, delay_ms = delay.as_millis() as u64, "Timeout scheduled");
        Ok(TimerHandle(id))
    }

    /// Run `callback` every `period`, first after one full period.
    pub fn set_interval<F>(self: &Arc<Self>, period: Duration, mut callback: F) -> Result<IntervalHandle, ModError>
    where
        F: FnMut() + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ModError::NoRuntime)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(ModError::ResourcesClosed(self.owner.clone()));
        }

        let period = period.max(MIN_INTERVAL);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());
        let task_gate = gate.clone();
        let owner = self.owner.clone();
        let task = runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !task_gate.run_if_open(&owner, &mut callback) {
                    break;
                }
            }
        });

        state.intervals.insert(
            id,
            Tracked {
                gate,
                task: task.abort_handle(),
            },
        );
        trace!(owner = %self.owner, interval = id, period_ms = period.as_millis() as u64, "Interval scheduled");
        Ok(IntervalHandle(id))
    }

    /// Cancel a pending timeout. Unknown or already fired handles are a no-op.
    pub fn clear_timeout(&self, handle: TimerHandle) -> bool {
        let tracked = self.state.lock().timeouts.remove(&handle.0);
        tracked.map(Tracked::cancel).is_some()
    }

    pub fn clear_interval(&self, handle: IntervalHandle) -> bool {
        let tracked = self.state.lock().intervals.remove(&handle.0);
        tracked.map(Tracked::cancel).is_some()
    }

    /// Cancel everything and refuse new registrations. Idempotent; returns how
    /// many timers were still live.
    pub fn cancel_all(&self) -> usize {
        let (timeouts, intervals) = {
            let mut state = self.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.timeouts),
                std::mem::take(&mut state.intervals),
            )
        };

        let cancelled = timeouts.len() + intervals.len();
        for tracked in timeouts.into_values().chain(intervals.into_values()) {
            tracked.cancel();
        }
        if cancelled > 0 {
            debug!(owner = %self.owner, cancelled, "Cancelled tracked timers");
        }
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_timeouts(&self) -> usize {
        self.state.lock().timeouts.len()
    }

    pub fn active_intervals(&self) -> usize {
        self.state.lock().intervals.len()
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock();
        state.timeouts.len() + state.intervals.len()
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, tracked) in state.timeouts.drain().chain(state.intervals.drain()) {
            tracked.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_untracks() {
        let tracker = ResourceTracker::new("test");
        let (count, seen) = counter();
        tracker
            .set_timeout(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(tracker.pending_timeouts(), 1);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pending_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_timeout_prevents_fire() {
        let tracker = ResourceTracker::new("test");
        let (count, seen) = counter();
        let handle = tracker
            .set_timeout(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(tracker.clear_timeout(handle));
        assert!(!tracker.clear_timeout(handle), "second clear is a no-op");

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_intervals() {
        let tracker = ResourceTracker::new("test");
        let (count, seen) = counter();
        tracker
            .set_interval(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        time::sleep(Duration::from_millis(35)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        assert_eq!(tracker.cancel_all(), 1);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.cancel_all(), 0, "cancel_all is idempotent");
    }

    #[tokio::test]
    async fn test_closed_tracker_rejects_new_timers() {
        let tracker = ResourceTracker::new("closing");
        tracker.cancel_all();
        assert!(tracker.is_closed());
        let err = tracker
            .set_interval(Duration::from_millis(5), || {})
            .unwrap_err();
        assert!(matches!(err, ModError::ResourcesClosed(owner) if owner == "closing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_may_clear_itself() {
        let tracker = ResourceTracker::new("test");
        let (count, seen) = counter();
        let slot: Arc<Mutex<Option<IntervalHandle>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&tracker);
        let own = slot.clone();
        let handle = tracker
            .set_interval(Duration::from_millis(10), move || {
                if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    if let (Some(tracker), Some(handle)) = (weak.upgrade(), *own.lock()) {
                        tracker.clear_interval(handle);
                    }
                }
            })
            .unwrap();
        *slot.lock() = Some(handle);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.active_intervals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_keeps_interval_alive() {
        let tracker = ResourceTracker::new("flaky");
        let (count, seen) = counter();
        tracker
            .set_interval(Duration::from_millis(10), move || {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            })
            .unwrap();

        time::sleep(Duration::from_millis(25)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        tracker.cancel_all();
    }

    #[test]
    fn test_requires_runtime() {
        let tracker = ResourceTracker::new("test");
        assert!(matches!(
            tracker.set_timeout(Duration::from_millis(1), || {}),
            Err(ModError::NoRuntime)
        ));
    }
}
