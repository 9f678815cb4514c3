use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::time::Interval;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::queue::{Next, Shared, Task};

/// How the dispatch loop executes a dequeued task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Dispatch {
    /// Run the task on the dispatch loop itself.
    ///
    /// The next tick is not awaited until the task has returned, so a slow
    /// task pushes back every task queued behind it. Missed ticks are not
    /// replayed, which keeps the rate bound intact after a slow task.
    ///
    /// Since tasks are plain closures, a task that blocks for a long time
    /// also occupies the runtime worker the loop is scheduled on.
    #[default]
    Inline,
    /// Hand the task off to [`tokio::task::spawn_blocking`] without waiting
    /// for it.
    ///
    /// The tick cadence is never disturbed by task execution, but slow tasks
    /// can pile up: the number of tasks executing at once is bounded only by
    /// the size of Tokio's blocking pool.
    ///
    /// Detached tasks are still tracked by the limiter, so a
    /// [`drain`](crate::RateLimiter::drain) only completes once every one
    /// of them has returned.
    Detached,
}

impl Dispatch {
    /// Execute a task, holding on to its tracker token until it returns.
    fn execute(self, task: Task, token: TaskTrackerToken) {
        match self {
            Dispatch::Inline => {
                run_task(task);
                drop(token);
            }
            Dispatch::Detached => {
                // NB: dropping the handle detaches the task, the token is what
                // keeps it tracked.
                drop(tokio::task::spawn_blocking(move || {
                    run_task(task);
                    drop(token);
                }));
            }
        }
    }
}

/// Run a single task, containing any panic it raises.
fn run_task(task: Task) {
    if let Err(_panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            panic = panic_message(&*_panic),
            "task panicked, continuing dispatch"
        );
    }
}

#[cfg(feature = "tracing")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// The dispatch loop.
///
/// Owns the interval timer, which is released when this future completes,
/// whichever way the loop exits.
pub(crate) async fn run(shared: Arc<Shared>, mut interval: Interval, mode: Dispatch) {
    #[cfg(feature = "tracing")]
    tracing::trace!(period = ?interval.period(), ?mode, "dispatch loop started");

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown().cancelled() => {
                break;
            }
            _ = interval.tick() => {
                match shared.pop() {
                    Next::Task(task, token) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("dispatching task");
                        mode.execute(task, token);
                    }
                    Next::Idle => {}
                    Next::Stopped => {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("dispatch loop exited");
}
