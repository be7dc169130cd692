//! Turns a consumer's verdict into a storage mutation

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::api::{TaskExecutionResult, TaskRecord};
use crate::error::QueueError;
use crate::retry::ReenqueueRetryStrategy;
use crate::settings::QueueLocation;
use crate::storage::{QueueStore, StoreTransaction};

enum Mutation {
    Delete,
    Reschedule { delay: Duration, reset_attempts: bool },
}

/// Applies `FINISH`, `REENQUEUE` and `FAIL` to the task row
pub struct TaskResultHandler {
    location: QueueLocation,
    store: Arc<dyn QueueStore>,
    reenqueue_strategy: ReenqueueRetryStrategy,
}

impl TaskResultHandler {
    pub fn new(
        location: QueueLocation,
        store: Arc<dyn QueueStore>,
        reenqueue_strategy: ReenqueueRetryStrategy,
    ) -> Self {
        Self {
            location,
            store,
            reenqueue_strategy,
        }
    }

    /// Record the outcome of one invocation
    ///
    /// - `Finish` deletes the row (already deleted rows are fine)
    /// - `Reenqueue` moves the row to `now + delay` and zeroes its attempts;
    ///   without a delay the reenqueue strategy picks one
    /// - `Fail` with a delay moves the row to `now + delay`, keeping attempts
    /// - `Fail` without a delay changes nothing: the lease taken at pick time
    ///   already decides when the task runs again
    ///
    /// Runs in `tx` when given, otherwise in a transaction of its own.
    pub async fn handle_result(
        &self,
        record: &TaskRecord,
        result: TaskExecutionResult,
        tx: Option<&mut dyn StoreTransaction>,
    ) -> Result<(), QueueError> {
        let mutation = match result {
            TaskExecutionResult::Finish => Mutation::Delete,
            TaskExecutionResult::Reenqueue { delay } => Mutation::Reschedule {
                delay: match delay {
                    Some(delay) => delay,
                    None => self.reenqueue_strategy.calculate_delay(record)?,
                },
                reset_attempts: true,
            },
            TaskExecutionResult::Fail { delay: Some(delay) } => Mutation::Reschedule {
                delay,
                reset_attempts: false,
            },
            TaskExecutionResult::Fail { delay: None } => return Ok(()),
        };

        match tx {
            Some(tx) => self.apply(tx, record.id, mutation).await,
            None => {
                let mut tx = self.store.begin().await?;
                self.apply(tx.as_mut(), record.id, mutation).await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        id: i64,
        mutation: Mutation,
    ) -> Result<(), QueueError> {
        match mutation {
            Mutation::Delete => {
                let deleted = tx.delete_task(&self.location, id).await?;
                debug!(queue = %self.location, task_id = id, deleted, "task finished");
            }
            Mutation::Reschedule {
                delay,
                reset_attempts,
            } => {
                let updated = tx
                    .reenqueue(&self.location, id, delay, reset_attempts)
                    .await?;
                debug!(
                    queue = %self.location,
                    task_id = id,
                    ?delay,
                    reset_attempts,
                    updated,
                    "task rescheduled"
                );
            }
        }
        Ok(())
    }
}
