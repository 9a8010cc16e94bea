//! Stop conditions for a drain pass.
//!
//! A limiter is asked once before every claim whether one more file may be
//! processed. Asking mutates its state.

use std::fmt;
use std::sync::Arc;

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn now(&self) -> i64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Allows at most a fixed number of items.
#[derive(Debug, Clone)]
pub struct CountLimiter {
    max: u64,
    processed: u64,
}

impl CountLimiter {
    /// A limiter that allows `max` items. `0` allows nothing.
    pub fn new(max: u64) -> Self {
        Self { max, processed: 0 }
    }

    /// Items still allowed.
    pub fn remaining(&self) -> u64 {
        self.max.saturating_sub(self.processed)
    }

    fn next(&mut self) -> bool {
        if self.processed >= self.max {
            return false;
        }

        self.processed += 1;
        true
    }
}

/// Allows items until a wall clock deadline fixed at construction.
#[derive(Clone)]
pub struct ExecutionTimeLimiter {
    clock: Arc<dyn Clock>,
    deadline: i64,
}

impl ExecutionTimeLimiter {
    /// A limiter whose deadline is `clock.now() + max_seconds`.
    pub fn new(clock: Arc<dyn Clock>, max_seconds: u64) -> Self {
        let max_seconds = i64::try_from(max_seconds).unwrap_or(i64::MAX);
        let deadline = clock.now().saturating_add(max_seconds);
        Self { clock, deadline }
    }

    /// Unix time after which nothing is allowed anymore.
    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    fn next(&self) -> bool {
        self.clock.now() < self.deadline
    }
}

impl fmt::Debug for ExecutionTimeLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTimeLimiter")
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Logical AND of its children, evaluated in order.
///
/// Evaluation stops at the first child that says no, so later children are
/// not advanced on that call.
#[derive(Debug, Clone, Default)]
pub struct MultiLimiter {
    limiters: Vec<Limiter>,
}

impl MultiLimiter {
    /// Combine `limiters`. Without children everything is allowed.
    pub fn new(limiters: Vec<Limiter>) -> Self {
        Self { limiters }
    }

    /// The combined limiters, in evaluation order.
    pub fn limiters(&self) -> &[Limiter] {
        &self.limiters
    }

    fn next(&mut self) -> bool {
        self.limiters.iter_mut().all(Limiter::next)
    }
}

/// Any of the supported stop conditions.
#[derive(Debug, Clone)]
pub enum Limiter {
    /// See [`CountLimiter`]
    Count(CountLimiter),
    /// See [`ExecutionTimeLimiter`]
    ExecutionTime(ExecutionTimeLimiter),
    /// See [`MultiLimiter`]
    Multi(MultiLimiter),
}

impl Limiter {
    /// Whether one more item may be processed.
    pub fn next(&mut self) -> bool {
        match self {
            Self::Count(limiter) => limiter.next(),
            Self::ExecutionTime(limiter) => limiter.next(),
            Self::Multi(limiter) => limiter.next(),
        }
    }

    /// Short name used in log output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::ExecutionTime(_) => "execution-time",
            Self::Multi(_) => "multi",
        }
    }
}

impl From<CountLimiter> for Limiter {
    fn from(limiter: CountLimiter) -> Self {
        Self::Count(limiter)
    }
}

impl From<ExecutionTimeLimiter> for Limiter {
    fn from(limiter: ExecutionTimeLimiter) -> Self {
        Self::ExecutionTime(limiter)
    }
}

impl From<MultiLimiter> for Limiter {
    fn from(limiter: MultiLimiter) -> Self {
        Self::Multi(limiter)
    }
}

/// Builds fresh limiters, one per worker, from the configured budgets.
#[derive(Clone)]
pub struct LimiterFactory {
    max_previews: u64,
    max_execution_time: u64,
    clock: Arc<dyn Clock>,
}

impl LimiterFactory {
    /// `0` disables the respective budget.
    pub fn new(max_previews: u64, max_execution_time: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_previews,
            max_execution_time,
            clock,
        }
    }

    /// A [`MultiLimiter`] of the enabled budgets. The clock starts now.
    pub fn build(&self) -> Limiter {
        let mut limiters: Vec<Limiter> = Vec::new();
        if self.max_previews > 0 {
            limiters.push(CountLimiter::new(self.max_previews).into());
        }
        if self.max_execution_time > 0 {
            limiters.push(ExecutionTimeLimiter::new(self.clock.clone(), self.max_execution_time).into());
        }
        MultiLimiter::new(limiters).into()
    }
}

impl fmt::Debug for LimiterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterFactory")
            .field("max_previews", &self.max_previews)
            .field("max_execution_time", &self.max_execution_time)
            .finish()
    }
}
