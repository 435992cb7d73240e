//! Event queue with a virtual clock
//!
//! Nothing runs until the test asks: [`ManualQueue::run_pending`] drains
//! posted tasks and [`ManualQueue::advance`] moves the clock, firing timers in
//! deadline order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cmux::{EventId, EventQueue, Task};
use tracing::trace;

struct Timer {
    id: EventId,
    deadline: Duration,
    task: Task,
}

#[derive(Default)]
struct Inner {
    now: Duration,
    next_id: u64,
    ready: VecDeque<Task>,
    /// Sorted by deadline, then by arming order
    timers: Vec<Timer>,
}

impl Inner {
    fn next_id(&mut self) -> EventId {
        self.next_id += 1;
        EventId(self.next_id)
    }
}

/// Deterministic [`EventQueue`] for tests
#[derive(Default)]
pub struct ManualQueue {
    inner: Mutex<Inner>,
}

impl ManualQueue {
    /// Create an empty queue at time zero
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run posted tasks, including ones they post, until none remain
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before the task runs
            let task = self.inner().ready.pop_front();
            let Some(task) = task else {
                return ran;
            };
            task();
            ran += 1;
        }
    }

    /// Move the clock forward, firing due timers and the tasks they post
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.inner().now + by;
        let mut fired = 0;
        loop {
            let due = {
                let mut inner = self.inner();
                if inner.timers.first().is_some_and(|t| t.deadline <= target) {
                    let timer = inner.timers.remove(0);
                    inner.now = timer.deadline;
                    Some(timer)
                } else {
                    inner.now = target;
                    None
                }
            };
            let Some(timer) = due else {
                break;
            };
            trace!("Timer {:?} fired at {:?}", timer.id, timer.deadline);
            (timer.task)();
            fired += 1;
            self.run_pending();
        }
        fired
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.inner().now
    }

    /// Tasks posted but not yet run
    pub fn pending_tasks(&self) -> usize {
        self.inner().ready.len()
    }

    /// Timers armed and not yet fired or cancelled
    pub fn pending_timers(&self) -> usize {
        self.inner().timers.len()
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner().timers.first().map(|t| t.deadline)
    }
}

impl EventQueue for ManualQueue {
    fn call(&self, task: Task) -> EventId {
        let mut inner = self.inner();
        let id = inner.next_id();
        inner.ready.push_back(task);
        id
    }

    fn call_in(&self, delay: Duration, task: Task) -> EventId {
        let mut inner = self.inner();
        let id = inner.next_id();
        let deadline = inner.now + delay;
        let at = inner.timers.partition_point(|t| t.deadline <= deadline);
        inner.timers.insert(at, Timer { id, deadline, task });
        id
    }

    fn cancel(&self, id: EventId) -> bool {
        let mut inner = self.inner();
        match inner.timers.iter().position(|t| t.id == id) {
            Some(index) => {
                inner.timers.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Task {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_tasks_wait_for_run_pending() {
        let queue = ManualQueue::new();
        let (log, task) = recorder();
        queue.call(task("a"));
        queue.call(task("b"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.pending_tasks(), 2);
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let queue = ManualQueue::new();
        let (log, task) = recorder();
        queue.call_in(Duration::from_millis(300), task("late"));
        queue.call_in(Duration::from_millis(100), task("early"));
        assert_eq!(queue.next_deadline(), Some(Duration::from_millis(100)));

        assert_eq!(queue.advance(Duration::from_millis(99)), 0);
        assert_eq!(queue.advance(Duration::from_millis(1)), 1);
        assert_eq!(queue.now(), Duration::from_millis(100));
        assert_eq!(queue.advance(Duration::from_secs(1)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
        assert_eq!(queue.pending_timers(), 0);
    }

    #[test]
    fn test_cancel() {
        let queue = ManualQueue::new();
        let (log, task) = recorder();
        let id = queue.call_in(Duration::from_millis(10), task("never"));
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        queue.advance(Duration::from_secs(1));
        assert!(log.lock().unwrap().is_empty());
    }
}
