//! Scheduling priority and retry policy.
//!
//! [`Priority`] orders jobs in the download queue (higher values first).
//! [`RetryPolicy`] controls automatic retry of transient transfer
//! failures; delays are a pure function of the attempt number so retry
//! schedules are deterministic.

use std::time::Duration;

/// Default initial delay for exponential backoff (100ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum delay for exponential backoff (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Job scheduling priority.
///
/// Jobs are started in priority order (higher first); insertion order
/// breaks ties. Higher-priority arrivals preempt lower-priority jobs by
/// pausing their resumable transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Fetches a user is actively waiting on.
    pub const FOREGROUND: Priority = Priority(100);

    /// Speculative background fetches.
    pub const BACKGROUND: Priority = Priority(0);

    /// Cleanup and repair work.
    pub const MAINTENANCE: Priority = Priority(-50);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::BACKGROUND
    }
}

/// How a transfer handles transient failures.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Fail immediately on the first error.
    None,

    /// A fixed number of attempts with a constant delay between them.
    Fixed {
        /// Maximum number of attempts, including the initial one.
        max_attempts: u32,
        delay: Duration,
    },

    /// Exponential backoff: the delay doubles (by `multiplier`) after
    /// each failure, capped at `max_delay`.
    ExponentialBackoff {
        /// Maximum number of attempts, including the initial one.
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Exponential backoff with the default delays.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// A fixed retry schedule.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// The delay before retry number `attempt` (1-based), or `None` when
    /// no more retries are allowed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = initial_delay.as_millis() as f64 * factor;
                let delay = Duration::from_millis(delay_ms.min(max_delay.as_millis() as f64) as u64);
                Some(delay.min(*max_delay))
            }
        }
    }

    /// Maximum number of attempts, including the initial one.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } | Self::ExponentialBackoff { max_attempts, .. } => {
                *max_attempts
            }
        }
    }
}
