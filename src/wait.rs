//! Retry engine behind every implicit wait
//!
//! A check is polled until it reports [`Attempt::Ready`], reports
//! [`Attempt::Fatal`], or the deadline passes. Not-yet outcomes are
//! swallowed while time remains; the last one becomes the source of the
//! timeout error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{Error, Result};

/// Default first retry interval
const INITIAL_INTERVAL: Duration = Duration::from_millis(5);

/// Retry interval cap
const MAX_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single check
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition holds; stop waiting
    Ready(T),
    /// Condition is false for now and may become true later
    NotYet(Error),
    /// Condition can never hold; stop waiting
    Fatal(Error),
}

impl<T> Attempt<T> {
    /// Not-yet outcome with an expectation message
    pub fn not_yet(message: impl Into<String>) -> Self {
        Self::NotYet(Error::ExpectationNotMet(message.into()))
    }

    /// Map a fallible operation: errors are fatal
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ready(value),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// Cooperative cancellation shared with whoever owns the surrounding test
///
/// Once cancelled a token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every sleeper
    pub fn cancel(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock() = true;
        wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock()
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns true if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let mut cancelled = flag.lock();
        wakeup.wait_while_for(&mut cancelled, |cancelled| !*cancelled, duration);
        *cancelled
    }
}

/// Time source for the retry loop
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep, returning true if cancelled
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Monotonic wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        cancel.sleep(duration)
    }
}

/// Polls a check against a deadline
#[derive(Clone)]
pub struct Waiter {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    initial_interval: Duration,
    max_interval: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            initial_interval: INITIAL_INTERVAL,
            max_interval: MAX_INTERVAL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the retry backoff; the interval doubles from `initial` up to `max`
    pub fn with_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }

    /// Run `check` until it is ready, fatal, or `deadline` has elapsed
    ///
    /// The deadline counts from the first attempt. A zero deadline makes
    /// exactly one attempt.
    pub fn retry_until<T, F>(&self, deadline: Duration, mut check: F) -> Result<T>
    where
        F: FnMut() -> Attempt<T>,
    {
        let start = self.clock.now();
        let mut interval = self.initial_interval;
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::WaitCancelled {
                    waited: self.clock.now().saturating_duration_since(start),
                });
            }

            attempts += 1;
            let reason = match check() {
                Attempt::Ready(value) => {
                    tracing::trace!(attempts, "Wait satisfied");
                    return Ok(value);
                }
                Attempt::Fatal(e) => {
                    tracing::trace!(attempts, error = %e, "Wait aborted");
                    return Err(e);
                }
                Attempt::NotYet(reason) => reason,
            };

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= deadline {
                tracing::debug!(?elapsed, attempts, reason = %reason, "Wait timed out");
                return Err(Error::WaitTimeout {
                    waited: elapsed,
                    attempts,
                    last: Box::new(reason),
                });
            }

            tracing::trace!(attempts, ?elapsed, reason = %reason, "Condition not met yet");

            let pause = interval.min(deadline - elapsed);
            if self.clock.sleep(pause, &self.cancel) {
                return Err(Error::WaitCancelled {
                    waited: self.clock.now().saturating_duration_since(start),
                });
            }
            interval = interval.saturating_mul(2).min(self.max_interval);
        }
    }
}
