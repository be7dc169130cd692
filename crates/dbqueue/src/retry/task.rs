//! Pick-time backoff

use std::time::Duration;

use crate::settings::{ConfigError, QueueSettings, TaskRetryType, RETRY_FIXED_INTERVAL_DELAY};

use super::{cap_delay, MAX_RETRY_DELAY};

/// Lease granted to a task every time it is picked
///
/// If the consumer never reports back, the task becomes visible again once
/// the lease runs out, so these delays are also the crash-retry schedule.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dbqueue::retry::TaskRetryStrategy;
///
/// let backoff = TaskRetryStrategy::geometric();
/// assert_eq!(backoff.delay(1), Duration::from_secs(60));
/// assert_eq!(backoff.delay(3), Duration::from_secs(240));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRetryStrategy {
    /// `initial + (attempt - 1) * step`
    ArithmeticBackoff { initial: Duration, step: Duration },

    /// `initial * 2^(attempt - 1)`
    GeometricBackoff { initial: Duration },

    /// Same delay for every attempt
    FixedInterval { delay: Duration },
}

impl Default for TaskRetryStrategy {
    fn default() -> Self {
        Self::geometric()
    }
}

impl TaskRetryStrategy {
    /// 1 minute, then 3, 5, 7...
    pub fn arithmetic() -> Self {
        Self::ArithmeticBackoff {
            initial: Duration::from_secs(60),
            step: Duration::from_secs(120),
        }
    }

    /// 1 minute, then 2, 4, 8...
    pub fn geometric() -> Self {
        Self::GeometricBackoff {
            initial: Duration::from_secs(60),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::FixedInterval { delay }
    }

    /// Strategy selected by the queue settings
    ///
    /// `FIXED_INTERVAL` fails when `RETRY_FIXED_INTERVAL_DELAY` is missing or malformed.
    pub fn from_settings(settings: &QueueSettings) -> Result<Self, ConfigError> {
        Ok(match settings.retry_type {
            TaskRetryType::GeometricBackoff => Self::geometric(),
            TaskRetryType::ArithmeticBackoff => Self::arithmetic(),
            TaskRetryType::FixedInterval => {
                Self::fixed(settings.required_duration(RETRY_FIXED_INTERVAL_DELAY)?)
            }
        })
    }

    /// Lease for the `attempts`-th pick (1-based; 0 is treated as 1)
    pub fn delay(&self, attempts: u32) -> Duration {
        let n = attempts.max(1) - 1;
        match self {
            Self::ArithmeticBackoff { initial, step } => {
                cap_delay(initial.saturating_add(step.saturating_mul(n)))
            }
            Self::GeometricBackoff { initial } => match 2u32.checked_pow(n) {
                Some(factor) => cap_delay(initial.saturating_mul(factor)),
                None => MAX_RETRY_DELAY,
            },
            Self::FixedInterval { delay } => cap_delay(*delay),
        }
    }
}
