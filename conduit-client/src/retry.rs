//! Retry policies for transient network failures.
//!
//! Every retry loop in the crate runs under an explicit budget: the policy
//! decides, per failure, whether to sleep and try again or to stop, and
//! exhausting the budget always surfaces as a terminal `GaveUp` error rather
//! than looping forever.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

/// Controls how a component reacts when an attempt fails with a recoverable
/// error.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    /// How many attempts have failed so far, this one included.
    pub fail_count:   NonZeroU32,
    /// Total time spent sleeping between attempts.
    pub slept_so_far: Duration,
}

/// Never retry.
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Exponential backoff with a hard attempt budget.
///
/// The sleep doubles from `base` on every failure and is capped at `cap`;
/// once `budget` attempts have failed the policy breaks and the caller
/// reports a terminal error.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub budget: u32,
    pub base:   Duration,
    pub cap:    Duration,
}

impl Backoff {
    pub const fn new(budget: u32, base: Duration, cap: Duration) -> Self {
        Self { budget, base, cap }
    }

    fn delay_for(&self, fail_count: u32) -> Duration {
        // 2^(n-1) * base, saturating; the shift is clamped so huge budgets
        // cannot overflow the multiplier.
        let exp = fail_count.saturating_sub(1).min(20);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            budget: 8,
            base:   Duration::from_millis(500),
            cap:    Duration::from_secs(30),
        }
    }
}

impl RetryPolicy for Backoff {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if ctx.fail_count.get() >= self.budget {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(self.delay_for(ctx.fail_count.get()))
    }
}
