//! The bounded task queue and the lifecycle state machine guarding it.
//!
//! Both live under the same lock. Admission checks the state and pushes in
//! one critical section, and the dispatch loop observes "queue empty" and
//! "drain requested" in one critical section, so a drain can neither stop
//! early nor admit work after it has been requested.

use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::{TaskTracker, TaskTrackerToken, TaskTrackerWaitFuture};

/// A unit of deferred work.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// The lifecycle state of a [`RateLimiter`].
///
/// The only transitions are `Running -> Draining -> Stopped` and
/// `Running -> Stopped`.
///
/// [`RateLimiter`]: crate::RateLimiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Accepting and dispatching tasks.
    Running,
    /// No longer accepting tasks, dispatching whatever is still queued.
    Draining,
    /// Terminal. Nothing is accepted or dispatched.
    Stopped,
}

/// Outcome of a single dequeue attempt by the dispatch loop.
pub(crate) enum Next {
    /// A task to execute, and the token keeping it tracked until it has
    /// finished executing.
    Task(Task, TaskTrackerToken),
    /// Nothing queued and no drain requested.
    Idle,
    /// The limiter is stopped, the loop should exit.
    Stopped,
}

struct Inner {
    state: State,
    tasks: VecDeque<Task>,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Cancelled exactly once, by whichever call moves the state into
    /// `Stopped`.
    shutdown: CancellationToken,
    /// Counts tasks from dequeue until they have finished executing. Closed
    /// together with the transition into `Stopped`.
    running: TaskTracker,
}

impl Shared {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Running,
                tasks: VecDeque::new(),
            }),
            capacity,
            shutdown: CancellationToken::new(),
            running: TaskTracker::new(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Wait until the limiter has stopped and no dequeued task is still
    /// executing.
    #[inline]
    pub(crate) fn idle(&self) -> TaskTrackerWaitFuture<'_> {
        self.running.wait()
    }

    pub(crate) fn state(&self) -> State {
        self.inner.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Try to enqueue a task without blocking.
    ///
    /// A rejected task is handed back so that it is dropped outside of the
    /// lock.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let mut inner = self.inner.lock();

        if inner.state != State::Running || inner.tasks.len() >= self.capacity {
            return Err(task);
        }

        inner.tasks.push_back(task);
        Ok(())
    }

    /// Dequeue the next task, completing a requested drain if the queue has
    /// run dry.
    pub(crate) fn pop(&self) -> Next {
        let mut inner = self.inner.lock();

        if inner.state == State::Stopped {
            return Next::Stopped;
        }

        if let Some(task) = inner.tasks.pop_front() {
            // Taken under the lock, so a concurrent stop can't close the
            // tracker between dequeue and execution.
            return Next::Task(task, self.running.token());
        }

        match inner.state {
            State::Running => Next::Idle,
            _ => {
                self.finish(&mut inner);
                Next::Stopped
            }
        }
    }

    /// Request a drain. Does nothing unless the limiter is running.
    pub(crate) fn drain(&self) {
        let mut inner = self.inner.lock();

        if inner.state == State::Running {
            inner.state = State::Draining;

            #[cfg(feature = "tracing")]
            tracing::debug!(queued = inner.tasks.len(), "draining");
        }
    }

    /// Stop immediately, returning the number of queued tasks discarded.
    pub(crate) fn stop(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            self.finish(&mut inner)
        };

        // Tasks are dropped here, after the lock has been released, since
        // their destructors may run arbitrary code.
        discarded.map_or(0, |tasks| tasks.len())
    }

    /// The single transition into `Stopped`.
    ///
    /// Returns `None` if the limiter was already stopped, in which case the
    /// shutdown token is left alone.
    fn finish(&self, inner: &mut Inner) -> Option<VecDeque<Task>> {
        if inner.state == State::Stopped {
            return None;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?inner.state, discarded = inner.tasks.len(), "stopped");

        inner.state = State::Stopped;
        self.running.close();
        self.shutdown.cancel();
        Some(mem::take(&mut inner.tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::{Next, Shared, State};

    fn noop() -> super::Task {
        Box::new(|| {})
    }

    #[test]
    fn test_push_respects_capacity() {
        let shared = Shared::new(2);

        assert!(shared.push(noop()).is_ok());
        assert!(shared.push(noop()).is_ok());
        assert!(shared.push(noop()).is_err());
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn test_drain_completes_on_empty_queue() {
        let shared = Shared::new(1);
        assert!(shared.push(noop()).is_ok());

        shared.drain();
        assert_eq!(shared.state(), State::Draining);
        shared.drain();
        assert_eq!(shared.state(), State::Draining);
        assert!(shared.push(noop()).is_err());

        assert!(matches!(shared.pop(), Next::Task(..)));
        assert!(!shared.shutdown().is_cancelled());
        assert!(matches!(shared.pop(), Next::Stopped));
        assert!(shared.shutdown().is_cancelled());
        assert_eq!(shared.state(), State::Stopped);
    }

    #[test]
    fn test_idle_without_drain() {
        let shared = Shared::new(1);
        assert!(matches!(shared.pop(), Next::Idle));
        assert_eq!(shared.state(), State::Running);
    }

    #[test]
    fn test_stop_discards_once() {
        let shared = Shared::new(4);
        assert!(shared.push(noop()).is_ok());
        assert!(shared.push(noop()).is_ok());

        assert_eq!(shared.stop(), 2);
        assert_eq!(shared.stop(), 0);
        shared.drain();
        assert_eq!(shared.state(), State::Stopped);
        assert!(matches!(shared.pop(), Next::Stopped));
        assert!(shared.push(noop()).is_err());
    }

    #[test]
    fn test_dequeued_task_is_tracked_past_stop() {
        let shared = Shared::new(2);
        assert!(shared.push(noop()).is_ok());

        let token = match shared.pop() {
            Next::Task(_task, token) => token,
            _ => panic!("expected a task"),
        };

        assert_eq!(shared.stop(), 0);
        assert!(shared.running.is_closed());
        assert_eq!(shared.running.len(), 1);

        drop(token);
        assert!(shared.running.is_empty());
    }
}
