//! Storage traits shared by every backend

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::api::TaskRecord;
use crate::retry::TaskRetryStrategy;
use crate::settings::{QueueLocation, QueueShardId};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// A row could not be mapped to a task
    #[error("invalid task row: {0}")]
    InvalidRow(String),

    /// Delay does not fit into a timestamp
    #[error("delay out of range: {0:?}")]
    DelayOutOfRange(Duration),

    /// Transaction was already committed or rolled back
    #[error("transaction is already finished")]
    TransactionFinished,
}

/// A task to insert
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub payload: Option<String>,
    pub execution_delay: Duration,
    pub correlation_id: Option<String>,
    pub actor: Option<String>,
}

/// Queue tables of one shard
///
/// Every mutation happens inside a [`StoreTransaction`].
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    fn shard_id(&self) -> &QueueShardId;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// An open transaction on one shard
///
/// Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert a task, visible after `execution_delay`; returns its id
    async fn enqueue(&mut self, location: &QueueLocation, task: NewTask)
        -> Result<i64, StoreError>;

    /// Lease the eligible task with the smallest process time
    ///
    /// Rows locked by other transactions are skipped. The returned record carries
    /// the incremented attempt count and the new lease deadline
    /// `now + retry.delay(attempts)`.
    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        retry: &TaskRetryStrategy,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Delete a task; false when it no longer exists
    async fn delete_task(&mut self, location: &QueueLocation, id: i64) -> Result<bool, StoreError>;

    /// Move a task's process time to `now + delay`, optionally zeroing its attempts
    async fn reenqueue(
        &mut self,
        location: &QueueLocation,
        id: i64,
        delay: Duration,
        reset_attempts: bool,
    ) -> Result<bool, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// `now + delay`, failing instead of overflowing
pub(crate) fn deadline(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or(StoreError::DelayOutOfRange(delay))
}
