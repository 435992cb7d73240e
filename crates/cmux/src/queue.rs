//! Serialized task execution and one-shot timers
//!
//! The multiplexer never blocks inside the readiness callback: it posts a
//! dispatch task to an [`EventQueue`], which runs tasks one at a time in
//! submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Work posted to an event queue
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifier of a posted task or timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// Deferred, serialized execution of tasks
pub trait EventQueue: Send + Sync {
    /// Post a task to run as soon as possible
    fn call(&self, task: Task) -> EventId;

    /// Post a task to run once `delay` has elapsed
    fn call_in(&self, delay: Duration, task: Task) -> EventId;

    /// Cancel a delayed task; returns false if it already ran or was unknown
    fn cancel(&self, id: EventId) -> bool;
}

type TimerMap = Arc<Mutex<HashMap<EventId, Option<AbortHandle>>>>;

/// [`EventQueue`] backed by a tokio runtime
///
/// Tasks are executed by a single worker task in submission order. Timers are
/// sleeping tasks that forward their payload to the worker when they expire.
/// Tasks run on a runtime thread, so they must not block on runtime work.
pub struct TokioEventQueue {
    tx: mpsc::UnboundedSender<Task>,
    handle: Handle,
    next_id: AtomicU64,
    timers: TimerMap,
}

impl TokioEventQueue {
    /// Start the worker on the given runtime
    pub fn new(handle: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            debug!("Event queue worker stopped");
        });

        Self {
            tx,
            handle,
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the worker on the current runtime
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending_timers(&self) -> usize {
        lock_timers(&self.timers).len()
    }

    fn next_id(&self) -> EventId {
        EventId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn lock_timers(timers: &TimerMap) -> MutexGuard<'_, HashMap<EventId, Option<AbortHandle>>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventQueue for TokioEventQueue {
    fn call(&self, task: Task) -> EventId {
        let id = self.next_id();
        if self.tx.send(task).is_err() {
            warn!("Event queue closed, dropping task {:?}", id);
        }
        id
    }

    fn call_in(&self, delay: Duration, task: Task) -> EventId {
        let id = self.next_id();
        // Registered before spawning so an immediate expiry still finds its entry
        lock_timers(&self.timers).insert(id, None);

        let tx = self.tx.clone();
        let timers = self.timers.clone();
        let sleeper = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if lock_timers(&timers).remove(&id).is_some() && tx.send(task).is_err() {
                warn!("Event queue closed, dropping timer {:?}", id);
            }
        });

        if let Some(slot) = lock_timers(&self.timers).get_mut(&id) {
            *slot = Some(sleeper.abort_handle());
        }
        id
    }

    fn cancel(&self, id: EventId) -> bool {
        match lock_timers(&self.timers).remove(&id) {
            Some(sleeper) => {
                if let Some(sleeper) = sleeper {
                    sleeper.abort();
                }
                true
            }
            None => false,
        }
    }
}
