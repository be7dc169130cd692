//! Retry delays: the pick-time lease and the reenqueue schedule

mod reenqueue;
mod task;

use std::time::Duration;

pub use reenqueue::ReenqueueRetryStrategy;
pub use task::TaskRetryStrategy;

/// Longest delay any strategy produces (10 years)
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

fn cap_delay(delay: Duration) -> Duration {
    delay.min(MAX_RETRY_DELAY)
}

/// Errors computing a retry delay
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("task {task_id} was reenqueued without a delay but the queue uses MANUAL reenqueue")]
    ManualReenqueueWithoutDelay { task_id: i64 },

    #[error("reenqueue delay sequence is empty")]
    EmptySequence,
}
