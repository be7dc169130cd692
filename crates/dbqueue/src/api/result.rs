//! Task and poll outcomes

use std::fmt;
use std::time::Duration;

use crate::settings::QueueSettings;

/// What a consumer decided about one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutionResult {
    /// Done, delete the row
    Finish,

    /// Run again later as a fresh task: attempts are reset
    ///
    /// Without a delay the queue's reenqueue strategy decides when.
    Reenqueue { delay: Option<Duration> },

    /// Failed, retry later keeping the attempt count
    ///
    /// Without a delay the lease taken at pick time decides when.
    Fail { delay: Option<Duration> },
}

impl TaskExecutionResult {
    pub fn finish() -> Self {
        Self::Finish
    }

    pub fn reenqueue() -> Self {
        Self::Reenqueue { delay: None }
    }

    pub fn reenqueue_with_delay(delay: Duration) -> Self {
        Self::Reenqueue { delay: Some(delay) }
    }

    pub fn fail() -> Self {
        Self::Fail { delay: None }
    }

    pub fn fail_with_delay(delay: Duration) -> Self {
        Self::Fail { delay: Some(delay) }
    }

    /// Explicit delay, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Finish => None,
            Self::Reenqueue { delay } | Self::Fail { delay } => *delay,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Finish => "finish",
            Self::Reenqueue { .. } => "reenqueue",
            Self::Fail { .. } => "fail",
        }
    }
}

impl fmt::Display for TaskExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delay() {
            Some(delay) => write!(f, "{}({delay:?})", self.action()),
            None => f.write_str(self.action()),
        }
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProcessingStatus {
    /// A task was picked and handled (or handed off)
    Processed,
    /// Nothing was eligible
    Skipped,
}

impl QueueProcessingStatus {
    /// How long the loop sleeps after this outcome
    pub fn wait_timeout(&self, settings: &QueueSettings) -> Duration {
        match self {
            Self::Processed => settings.between_task_timeout,
            Self::Skipped => settings.no_task_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_delay_and_display() {
        assert_eq!(TaskExecutionResult::finish().delay(), None);
        assert_eq!(TaskExecutionResult::fail().delay(), None);
        assert_eq!(
            TaskExecutionResult::reenqueue_with_delay(Duration::from_secs(3)).delay(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(TaskExecutionResult::reenqueue().to_string(), "reenqueue");
        assert_eq!(
            TaskExecutionResult::fail_with_delay(Duration::from_millis(5)).to_string(),
            "fail(5ms)"
        );
    }

    #[test]
    fn test_wait_timeout_by_status() {
        let settings = QueueSettings::new(Duration::from_millis(5), Duration::from_secs(3600));

        assert_eq!(
            QueueProcessingStatus::Skipped.wait_timeout(&settings),
            Duration::from_millis(5)
        );
        assert_eq!(
            QueueProcessingStatus::Processed.wait_timeout(&settings),
            Duration::from_secs(3600)
        );
    }
}
