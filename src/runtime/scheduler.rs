//! Deferred Task Scheduling
//!
//! The store needs two primitives: "run after N ms" (TTL timers, debounce)
//! and "run when idle, else after a timeout" (idle sync, startup housekeeping).
//! Both return a [`TaskHandle`] that cancels the task if it has not run yet.
//!
//! - [`TokioScheduler`] spawns Tokio tasks, like the background sweeper.
//! - [`ManualScheduler`] runs tasks only when virtual time is advanced, so
//!   tests can step through debounce windows and expiry deadlines exactly.
//!
//! Tasks never run inside the call that scheduled them.

use crate::runtime::clock::{Clock, ManualClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Runs tasks later.
pub trait Scheduler: Send + Sync {
    /// Runs `task` once `delay` has elapsed.
    fn run_after(&self, delay: Duration, task: Task) -> TaskHandle;

    /// Runs `task` at the next idle opportunity, or after `timeout` at the latest.
    fn run_when_idle(&self, timeout: Duration, task: Task) -> TaskHandle;

    /// Cancels a task that has not started. Unknown handles are ignored.
    fn cancel(&self, handle: TaskHandle);
}

/// Schedules tasks on a Tokio runtime.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioScheduler {
    /// Schedules onto the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules onto the runtime of the calling context, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Number of tasks that have not run yet.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    fn spawn<F>(&self, wait: F, task: Task) -> TaskHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Hold the map lock across the spawn so a task that finishes instantly
        // cannot try to deregister before it was registered.
        let mut registry = self.tasks.lock();
        let join = self.runtime.spawn(async move {
            wait.await;
            if tasks.lock().remove(&id).is_some() {
                task();
            }
        });
        registry.insert(id, join.abort_handle());
        TaskHandle(id)
    }
}

impl Scheduler for TokioScheduler {
    fn run_after(&self, delay: Duration, task: Task) -> TaskHandle {
        self.spawn(tokio::time::sleep(delay), task)
    }

    fn run_when_idle(&self, timeout: Duration, task: Task) -> TaskHandle {
        // Tokio has no idle hook; yielding lets already-queued work go first.
        let wait = async move {
            tokio::select! {
                _ = tokio::task::yield_now() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
        };
        self.spawn(wait, task)
    }

    fn cancel(&self, handle: TaskHandle) {
        if let Some(abort) = self.tasks.lock().remove(&handle.0) {
            abort.abort();
            trace!(task = handle.0, "Cancelled scheduled task");
        }
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

struct Scheduled {
    id: u64,
    due: u64,
    idle: bool,
    task: Task,
}

#[derive(Default)]
struct Queue {
    next_id: u64,
    entries: Vec<Scheduled>,
}

/// A scheduler driven by virtual time.
///
/// Tasks run only from [`ManualScheduler::advance`] (in due order, with the
/// clock set to each task's due time) and [`ManualScheduler::run_idle`].
pub struct ManualScheduler {
    clock: ManualClock,
    queue: Mutex<Queue>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: Mutex::new(Queue::default()),
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Number of idle tasks waiting to run.
    pub fn pending_idle(&self) -> usize {
        self.queue.lock().entries.iter().filter(|e| e.idle).count()
    }

    fn push(&self, due: u64, idle: bool, task: Task) -> TaskHandle {
        let mut queue = self.queue.lock();
        queue.next_id += 1;
        let id = queue.next_id;
        queue.entries.push(Scheduled {
            id,
            due,
            idle,
            task,
        });
        TaskHandle(id)
    }

    fn pop_due(&self, until: u64) -> Option<Scheduled> {
        let mut queue = self.queue.lock();
        let index = queue
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.due <= until)
            .min_by_key(|(_, e)| (e.due, e.id))
            .map(|(i, _)| i)?;
        Some(queue.entries.remove(index))
    }

    /// Moves time forward, running every task that falls due on the way.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.now_ms() + by.as_millis() as u64;
        while let Some(entry) = self.pop_due(target) {
            if entry.due > self.clock.now_ms() {
                self.clock.set(entry.due);
            }
            (entry.task)();
        }
        self.clock.set(target);
    }

    /// Runs every idle task, including idle tasks scheduled while doing so.
    pub fn run_idle(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                let index = queue.entries.iter().position(|e| e.idle);
                index.map(|i| queue.entries.remove(i))
            };
            match next {
                Some(entry) => (entry.task)(),
                None => break,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn run_after(&self, delay: Duration, task: Task) -> TaskHandle {
        let due = self.clock.now_ms() + delay.as_millis() as u64;
        self.push(due, false, task)
    }

    fn run_when_idle(&self, timeout: Duration, task: Task) -> TaskHandle {
        let due = self.clock.now_ms() + timeout.as_millis() as u64;
        self.push(due, true, task)
    }

    fn cancel(&self, handle: TaskHandle) {
        self.queue.lock().entries.retain(|e| e.id != handle.0);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.clock.now_ms())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<(&'static str, u64)>>>, ManualClock) {
        (Arc::new(Mutex::new(Vec::new())), ManualClock::new(0))
    }

    #[test]
    fn test_manual_runs_in_due_order() {
        let (log, clock) = recorder();
        let scheduler = ManualScheduler::new(clock.clone());

        for (name, delay) in [("late", 300), ("early", 100), ("mid", 200)] {
            let log = Arc::clone(&log);
            let clock = clock.clone();
            scheduler.run_after(
                Duration::from_millis(delay),
                Box::new(move || log.lock().push((name, clock.now_ms()))),
            );
        }

        scheduler.advance(Duration::from_millis(250));
        assert_eq!(*log.lock(), vec![("early", 100), ("mid", 200)]);
        assert_eq!(clock.now_ms(), 250);

        scheduler.advance(Duration::from_millis(100));
        assert_eq!(log.lock().last(), Some(&("late", 300)));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_manual_cancel() {
        let (log, clock) = recorder();
        let scheduler = ManualScheduler::new(clock);
        let log2 = Arc::clone(&log);
        let handle = scheduler.run_after(
            Duration::from_millis(10),
            Box::new(move || log2.lock().push(("x", 0))),
        );
        scheduler.cancel(handle);
        scheduler.advance(Duration::from_secs(1));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_manual_idle_runs_on_demand_or_timeout() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = ManualScheduler::new(ManualClock::new(0));

        let c = Arc::clone(&count);
        scheduler.run_when_idle(
            Duration::from_secs(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.run_idle();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        scheduler.run_when_idle(
            Duration::from_secs(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.advance(Duration::from_secs(4));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_run_after_and_cancel() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        scheduler.run_after(
            Duration::from_millis(50),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let c = Arc::clone(&count);
        let cancelled = scheduler.run_after(
            Duration::from_millis(50),
            Box::new(move || {
                c.fetch_add(10, Ordering::SeqCst);
            }),
        );
        scheduler.cancel(cancelled);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_tokio_idle_runs() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.run_when_idle(
            Duration::from_secs(1),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
    }
}
