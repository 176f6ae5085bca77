//! Retry as data: a policy maps an attempt number and the error that caused
//! it to a verdict, and the loop applying the verdict lives at the call
//! site. Used by config refresh, channel connect and stream repair.

use crate::error::{DcpError, DcpResult};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pure delay schedule: attempt number (1-based) to sleep duration.
#[derive(Debug, Copy, Clone)]
pub enum Delay {
    Fixed(Duration),
    /// Doubles from `base` per attempt, saturating at `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl Delay {
    pub fn calculate(&self, attempt: u32) -> Duration {
        match *self {
            Delay::Fixed(delay) => delay,
            Delay::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::max_value());
                base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
            }
        }
    }
}

/// What to do about a failed attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    /// Sleep, then try again.
    Sleep(Duration),
    /// The error is terminal by classification; propagate it verbatim.
    Interrupt,
    /// The attempt budget is spent.
    GiveUp,
}

type InterruptFn = dyn Fn(&DcpError) -> bool + Send + Sync;
type ObserverFn = dyn Fn(u32, &DcpError, Duration) + Send + Sync;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Delay,
    interrupt: Option<Arc<InterruptFn>>,
    observer: Option<Arc<ObserverFn>>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Delay) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.min(u32::max_value() - 1),
            delay,
            interrupt: None,
            observer: None,
        }
    }

    /// Errors matching the predicate are not retried; the caller sees them
    /// unchanged.
    pub fn with_interrupt<F>(mut self, predicate: F) -> RetryPolicy
    where
        F: Fn(&DcpError) -> bool + Send + Sync + 'static,
    {
        self.interrupt = Some(Arc::new(predicate));
        self
    }

    /// Invoked as `(attempt, error, delay)` before each sleep.
    pub fn with_observer<F>(mut self, observer: F) -> RetryPolicy
    where
        F: Fn(u32, &DcpError, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Judge failure number `attempt` (1-based).
    pub fn verdict(&self, attempt: u32, error: &DcpError) -> Verdict {
        if attempt > self.max_attempts {
            return Verdict::GiveUp;
        }

        if let Some(predicate) = &self.interrupt {
            if predicate(error) {
                return Verdict::Interrupt;
            }
        }

        Verdict::Sleep(self.delay.calculate(attempt))
    }

    fn observe(&self, attempt: u32, error: &DcpError, delay: Duration) {
        if let Some(observer) = &self.observer {
            observer(attempt, error, delay);
        }
    }
}

/// Run `op` under `policy`, sleeping between attempts. Exhaustion wraps the
/// last error in `CannotRetry` with the number of failed attempts allowed by
/// the policy; an interrupting error propagates verbatim.
pub fn retry_blocking<T, F>(policy: &RetryPolicy, mut op: F) -> DcpResult<T>
where
    F: FnMut() -> DcpResult<T>,
{
    let mut attempt = 1u32;

    loop {
        let error = match op() {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match policy.verdict(attempt, &error) {
            Verdict::Interrupt => return Err(error),
            Verdict::GiveUp => {
                return Err(DcpError::CannotRetry {
                    attempts: attempt - 1,
                    cause: Box::new(error),
                })
            }
            Verdict::Sleep(delay) => {
                policy.observe(attempt, &error, delay);
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
