#![deny(missing_docs)]
//! A task queue which executes submitted work at a fixed rate, based on the
//! [leaky bucket] algorithm.
//!
//! Work is submitted as closures. Each submission is either admitted into a
//! bounded queue or rejected on the spot, and a background dispatch loop
//! executes at most one queued task per tick of a fixed interval. However
//! bursty submission is, execution never exceeds the configured rate. Unlike
//! a token bucket, no credit accumulates while the queue is idle.
//!
//! Since this crate uses timing facilities from tokio it has to be used within
//! a Tokio runtime with the [`time` feature] enabled.
//!
//! <br>
//!
//! ## Usage
//!
//! The core type is [`RateLimiter`]. Tasks are offered through
//! [`RateLimiter::submit`], which never blocks: it returns `false` if the
//! queue is full or the limiter is shutting down, and callers needing
//! guaranteed execution must retry or buffer upstream.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use leaky_throttle::RateLimiter;
//! use tokio::time::{Duration, Instant};
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), leaky_throttle::Error> {
//! let limiter = RateLimiter::per_second(10.0, 100)?;
//! let done = Arc::new(AtomicUsize::new(0));
//! let start = Instant::now();
//!
//! for _ in 0..20 {
//!     let done = done.clone();
//!
//!     assert!(limiter.submit(move || {
//!         done.fetch_add(1, Ordering::SeqCst);
//!     }));
//! }
//!
//! // Run everything which is queued, then stop.
//! limiter.drain().await;
//!
//! assert_eq!(done.load(Ordering::SeqCst), 20);
//! assert!(Instant::now().duration_since(start) >= Duration::from_secs(2));
//! # Ok(()) }
//! ```
//!
//! <br>
//!
//! ## Shutting down
//!
//! A limiter is stopped in one of two ways:
//!
//! * [`RateLimiter::drain`] stops accepting new tasks, keeps dispatching at
//!   the configured rate until the queue is empty, and then stops. The
//!   returned future completes once the limiter has stopped.
//! * [`RateLimiter::stop`] stops immediately. Tasks still in the queue are
//!   discarded without being executed.
//!
//! Both are idempotent, and a stopped limiter can't be restarted. Dropping a
//! [`RateLimiter`] stops it, so drain it first if queued work matters.
//!
//! ```
//! use leaky_throttle::{RateLimiter, State};
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), leaky_throttle::Error> {
//! let limiter = RateLimiter::per_second(1.0, 10)?;
//!
//! assert!(limiter.submit(|| unreachable!("discarded by stop")));
//! limiter.stop();
//!
//! assert_eq!(limiter.state(), State::Stopped);
//! assert!(!limiter.submit(|| {}));
//!
//! // Draining a stopped limiter completes immediately.
//! limiter.drain().await;
//! # Ok(()) }
//! ```
//!
//! <br>
//!
//! ## Implementation details
//!
//! The queue and the lifecycle [`State`] are guarded by a single lock. This
//! means that admission observes a drain request atomically with pushing
//! onto the queue, and that the dispatch loop observes an empty queue
//! atomically with checking whether a drain has been requested. No task is
//! accepted once [`RateLimiter::drain`] has been called, and a drain can't
//! complete while anything is still queued.
//!
//! The dispatch loop is spawned on construction and the first tick happens
//! one interval later. How a dequeued task is executed is decided by
//! [`Dispatch`]: either on the loop itself ([`Dispatch::Inline`], the
//! default), or detached on Tokio's blocking pool ([`Dispatch::Detached`]).
//! In either case a panicking task doesn't take the loop down with it.
//!
//! With the `tracing` feature enabled, lifecycle transitions and task panics
//! are reported through [`tracing`].
//!
//! [leaky bucket]: https://en.wikipedia.org/wiki/Leaky_bucket
//! [`time` feature]: https://docs.rs/tokio/1/tokio/#feature-flags
//! [`tracing`]: https://docs.rs/tracing

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerWaitFuture;

mod dispatch;
mod queue;

pub use self::dispatch::Dispatch;
pub use self::queue::State;

use self::queue::Shared;

/// Error raised when constructing a [`RateLimiter`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configured rate is not a finite, positive number.
    #[error("Invalid rate {rate}, must be finite and positive")]
    InvalidRate {
        /// The rejected rate.
        rate: f64,
    },
    /// The interval between ticks is zero.
    #[error("Invalid interval {interval:?}, must be non-zero")]
    InvalidInterval {
        /// The rejected interval.
        interval: Duration,
    },
    /// The interval between ticks is too large to be represented.
    #[error("Interval between ticks is too large")]
    IntervalOverflow,
}

/// Builder for a [`RateLimiter`].
///
/// Constructed through [`RateLimiter::builder`].
///
/// # Examples
///
/// ```
/// use leaky_throttle::{Dispatch, RateLimiter};
/// use tokio::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() -> Result<(), leaky_throttle::Error> {
/// // 120 tasks per minute, up to 50 queued.
/// let limiter = RateLimiter::builder()
///     .rate(120.0)
///     .per(Duration::from_secs(60))
///     .capacity(50)
///     .dispatch(Dispatch::Detached)
///     .build()?;
///
/// assert_eq!(limiter.interval(), Duration::from_millis(500));
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    rate: Option<f64>,
    per: Option<Duration>,
    interval: Option<Duration>,
    capacity: Option<usize>,
    dispatch: Option<Dispatch>,
}

impl Builder {
    /// Number of tasks to dispatch per unit of time, see [`Builder::per`].
    ///
    /// Defaults to `1.0`.
    #[inline(always)]
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// The unit of time the rate is expressed in.
    ///
    /// Defaults to one second.
    #[inline(always)]
    pub fn per(mut self, per: Duration) -> Self {
        self.per = Some(per);
        self
    }

    /// Set the interval between ticks directly.
    ///
    /// This takes precedence over [`Builder::rate`] and [`Builder::per`].
    #[inline(always)]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// The maximum number of tasks which may be queued at once.
    ///
    /// A capacity of zero rejects every submission. Defaults to `100`.
    #[inline(always)]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// How dequeued tasks are executed.
    ///
    /// Defaults to [`Dispatch::Inline`].
    #[inline(always)]
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Construct a new rate limiter and start its dispatch loop.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::InvalidRate`] if the rate is zero, negative or
    /// not finite, with [`Error::InvalidInterval`] if the resulting interval
    /// is zero, and with [`Error::IntervalOverflow`] if it can't be
    /// represented.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> Result<RateLimiter, Error> {
        const DEFAULT_RATE: f64 = 1.0;
        const DEFAULT_PER: Duration = Duration::from_secs(1);
        const DEFAULT_CAPACITY: usize = 100;

        let interval = match self.interval {
            Some(interval) => interval,
            None => interval_for(
                self.rate.unwrap_or(DEFAULT_RATE),
                self.per.unwrap_or(DEFAULT_PER),
            )?,
        };

        if interval.is_zero() {
            return Err(Error::InvalidInterval { interval });
        }

        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY);
        let dispatch = self.dispatch.unwrap_or_default();

        let first = Instant::now()
            .checked_add(interval)
            .ok_or(Error::IntervalOverflow)?;

        let mut ticker = time::interval_at(first, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shared = Arc::new(Shared::new(capacity));

        #[cfg(feature = "tracing")]
        tracing::debug!(?interval, capacity, ?dispatch, "starting rate limiter");

        tokio::spawn(dispatch::run(shared.clone(), ticker, dispatch));

        Ok(RateLimiter {
            shared,
            interval,
            dispatch,
        })
    }
}

/// Compute the interval between ticks for `rate` tasks per `per`.
fn interval_for(rate: f64, per: Duration) -> Result<Duration, Error> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::InvalidRate { rate });
    }

    Duration::try_from_secs_f64(per.as_secs_f64() / rate).map_err(|_| Error::IntervalOverflow)
}

/// A leaky bucket rate limiter executing submitted tasks at a fixed rate.
///
/// See the [crate level documentation](crate) for details.
///
/// The limiter is not `Clone`. To submit from multiple places, share it
/// through an [`Arc`].
pub struct RateLimiter {
    shared: Arc<Shared>,
    interval: Duration,
    dispatch: Dispatch,
}

impl RateLimiter {
    /// Construct a new rate limiter through a builder.
    pub fn builder() -> Builder {
        Builder {
            rate: None,
            per: None,
            interval: None,
            capacity: None,
            dispatch: None,
        }
    }

    /// Construct a rate limiter executing at most `rate` tasks per second,
    /// with room for `capacity` queued tasks.
    ///
    /// # Errors
    ///
    /// See [`Builder::build`].
    ///
    /// # Examples
    ///
    /// ```
    /// use leaky_throttle::RateLimiter;
    /// use tokio::time::Duration;
    ///
    /// # #[tokio::main(flavor = "current_thread", start_paused = true)]
    /// # async fn main() -> Result<(), leaky_throttle::Error> {
    /// let limiter = RateLimiter::per_second(500.0, 1000)?;
    /// assert_eq!(limiter.interval(), Duration::from_millis(2));
    ///
    /// assert!(RateLimiter::per_second(0.0, 1000).is_err());
    /// # Ok(()) }
    /// ```
    pub fn per_second(rate: f64, capacity: usize) -> Result<Self, Error> {
        Self::per_rate(rate, Duration::from_secs(1), capacity)
    }

    /// Construct a rate limiter executing at most `rate` tasks per `unit` of
    /// time, with room for `capacity` queued tasks.
    ///
    /// # Errors
    ///
    /// See [`Builder::build`].
    pub fn per_rate(rate: f64, unit: Duration, capacity: usize) -> Result<Self, Error> {
        Self::builder()
            .rate(rate)
            .per(unit)
            .capacity(capacity)
            .build()
    }

    /// Submit a task for execution.
    ///
    /// Returns `true` if the task was queued, and `false` if it was rejected
    /// because the queue is full or the limiter is draining or stopped. This
    /// never blocks, and never executes the task itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use leaky_throttle::RateLimiter;
    ///
    /// # #[tokio::main(flavor = "current_thread", start_paused = true)]
    /// # async fn main() -> Result<(), leaky_throttle::Error> {
    /// let limiter = RateLimiter::per_second(10.0, 1)?;
    ///
    /// assert!(limiter.submit(|| println!("first")));
    /// // The queue is full until the next tick.
    /// assert!(!limiter.submit(|| println!("second")));
    /// # Ok(()) }
    /// ```
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Box::new(task)).is_ok()
    }

    /// Submit a task unless `token` has already been cancelled.
    ///
    /// Cancellation is only observed at submission. Once a task has been
    /// queued it will be executed regardless of what happens to `token`,
    /// unless the limiter is stopped first.
    ///
    /// # Examples
    ///
    /// ```
    /// use leaky_throttle::RateLimiter;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main(flavor = "current_thread", start_paused = true)]
    /// # async fn main() -> Result<(), leaky_throttle::Error> {
    /// let limiter = RateLimiter::per_second(10.0, 10)?;
    /// let token = CancellationToken::new();
    ///
    /// assert!(limiter.submit_with(&token, || {}));
    /// token.cancel();
    /// assert!(!limiter.submit_with(&token, || {}));
    /// assert_eq!(limiter.len(), 1);
    /// # Ok(()) }
    /// ```
    pub fn submit_with<F>(&self, token: &CancellationToken, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if token.is_cancelled() {
            return false;
        }

        self.submit(task)
    }

    /// Submit a task unless `deadline` has already passed.
    ///
    /// A deadline equal to the current instant counts as passed.
    pub fn submit_before<F>(&self, deadline: Instant, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if Instant::now() >= deadline {
            return false;
        }

        self.submit(task)
    }

    /// Stop the limiter immediately.
    ///
    /// Any tasks which are still queued are dropped without being executed.
    /// Tasks which are already executing run to completion, and can be waited
    /// for through [`RateLimiter::drain`]. Calling this on a limiter which is
    /// already stopped does nothing.
    pub fn stop(&self) {
        let _discarded = self.shared.stop();

        #[cfg(feature = "tracing")]
        if _discarded > 0 {
            tracing::debug!(discarded = _discarded, "discarded queued tasks");
        }
    }

    /// Stop accepting new tasks and stop the limiter once every queued task
    /// has been dispatched.
    ///
    /// The drain is requested when this is called, and the returned future
    /// completes once the limiter has stopped and every dispatched task has
    /// finished executing, including tasks running detached under
    /// [`Dispatch::Detached`]. Tasks keep being dispatched at the configured
    /// rate while draining.
    ///
    /// If the limiter is already draining, this waits for that drain to
    /// complete. If it is already stopped, the future completes as soon as
    /// no task is executing.
    ///
    /// # Examples
    ///
    /// ```
    /// use leaky_throttle::{RateLimiter, State};
    ///
    /// # #[tokio::main(flavor = "current_thread", start_paused = true)]
    /// # async fn main() -> Result<(), leaky_throttle::Error> {
    /// let limiter = RateLimiter::per_second(100.0, 10)?;
    /// assert!(limiter.submit(|| {}));
    ///
    /// let drain = limiter.drain();
    /// assert_eq!(limiter.state(), State::Draining);
    /// assert!(!limiter.submit(|| {}));
    ///
    /// drain.await;
    /// assert_eq!(limiter.state(), State::Stopped);
    /// assert!(limiter.is_empty());
    /// # Ok(()) }
    /// ```
    pub fn drain(&self) -> Drain<'_> {
        self.shared.drain();

        Drain {
            idle: self.shared.idle(),
        }
    }

    /// The current lifecycle state of the limiter.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Test if the limiter has stopped.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown().is_cancelled()
    }

    /// The number of tasks currently queued.
    ///
    /// This is a snapshot, the queue may change as soon as it has been
    /// taken.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Test if no tasks are currently queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The maximum number of tasks which may be queued at once.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// The interval between ticks of the dispatch loop.
    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How dequeued tasks are executed.
    #[inline]
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("interval", &self.interval)
            .field("capacity", &self.capacity())
            .field("queued", &self.len())
            .field("state", &self.state())
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

pin_project! {
    /// The future returned by [`RateLimiter::drain`].
    ///
    /// Completes once the limiter has stopped and no dispatched task is still
    /// executing.
    pub struct Drain<'a> {
        #[pin]
        idle: TaskTrackerWaitFuture<'a>,
    }
}

impl Future for Drain<'_> {
    type Output = ();

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().idle.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::{Dispatch, Error, RateLimiter, State};
    use tokio::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_debug() {
        let limiter = RateLimiter::builder()
            .rate(4.0)
            .capacity(20)
            .build()
            .expect("build rate limiter");

        assert!(limiter.submit(|| {}));
        assert!(limiter.submit(|| {}));

        let expected = "RateLimiter { interval: 250ms, capacity: 20, queued: 2, state: Running, dispatch: Inline }";
        assert_eq!(format!("{:?}", limiter), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_builder_defaults() {
        let limiter = RateLimiter::builder().build().expect("build rate limiter");

        assert_eq!(limiter.interval(), Duration::from_secs(1));
        assert_eq!(limiter.capacity(), 100);
        assert_eq!(limiter.dispatch(), Dispatch::Inline);
        assert_eq!(limiter.state(), State::Running);
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_interval_wins() {
        let limiter = RateLimiter::builder()
            .rate(1000.0)
            .interval(Duration::from_millis(300))
            .build()
            .expect("build rate limiter");

        assert_eq!(limiter.interval(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_rate_unit() {
        let limiter = RateLimiter::per_rate(2.0, Duration::from_secs(60), 1)
            .expect("build rate limiter");

        assert_eq!(limiter.interval(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_configuration() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                RateLimiter::per_second(rate, 10),
                Err(Error::InvalidRate { .. })
            ));
        }

        assert!(matches!(
            RateLimiter::builder().interval(Duration::ZERO).build(),
            Err(Error::InvalidInterval { .. })
        ));

        assert!(matches!(
            RateLimiter::per_rate(1.0, Duration::ZERO, 10),
            Err(Error::InvalidInterval { .. })
        ));

        assert!(matches!(
            RateLimiter::per_second(f64::MIN_POSITIVE, 10),
            Err(Error::IntervalOverflow)
        ));
    }

    #[test]
    fn test_error_display() {
        let error = Error::InvalidRate { rate: -2.0 };
        assert_eq!(
            error.to_string(),
            "Invalid rate -2, must be finite and positive"
        );
    }
}
