//! Cancellable, optionally time-bounded waiting
//!
//! Every executor waits for its payload in short slices through [`WaitPolicy`], so a
//! Ctrl+C or an expired timeout is noticed within one slice and the executor's teardown
//! still runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LoaderError, Result};

/// Longest single blocking wait between cancellation checks
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Shared flag flipped by the interrupt handler
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// When to give up waiting on a payload
#[derive(Clone, Debug)]
pub struct WaitPolicy {
    token: CancelToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl WaitPolicy {
    /// Start the timeout clock now
    pub fn new(token: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Wait until completion, interruptible only through `token`
    pub fn unbounded(token: CancelToken) -> Self {
        Self::new(token, None)
    }

    /// `Err(Cancelled)` or `Err(TimedOut)` once waiting should stop
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(LoaderError::TimedOut(timeout));
            }
        }
        Ok(())
    }

    /// Length of the next blocking wait
    pub fn slice(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(WAIT_SLICE),
            None => WAIT_SLICE,
        }
    }

    /// Call `poll` with a slice length until it yields a value, an error, or the
    /// policy says stop.
    pub fn wait_until<T, F>(&self, mut poll: F) -> Result<T>
    where
        F: FnMut(Duration) -> Result<Option<T>>,
    {
        loop {
            self.check()?;
            if let Some(value) = poll(self.slice())? {
                return Ok(value);
            }
        }
    }
}
