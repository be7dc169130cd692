//! Lease acquisition for one queue on one shard

use std::sync::Arc;

use tracing::trace;

use crate::api::{TaskLifecycleListener, TaskRecord};
use crate::clock::Clock;
use crate::retry::TaskRetryStrategy;
use crate::settings::{QueueLocation, QueueShardId};
use crate::storage::{StoreError, StoreTransaction};

/// Picks the next eligible task and extends its lease
pub struct TaskPicker {
    shard_id: QueueShardId,
    location: QueueLocation,
    retry_strategy: TaskRetryStrategy,
    listener: Arc<dyn TaskLifecycleListener>,
    clock: Arc<dyn Clock>,
}

impl TaskPicker {
    pub fn new(
        shard_id: QueueShardId,
        location: QueueLocation,
        retry_strategy: TaskRetryStrategy,
        listener: Arc<dyn TaskLifecycleListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shard_id,
            location,
            retry_strategy,
            listener,
            clock,
        }
    }

    /// Lease one task inside `tx`; `None` when nothing is eligible
    ///
    /// The lease only becomes visible to other pickers once `tx` commits.
    pub async fn pick_task(
        &self,
        tx: &mut dyn StoreTransaction,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let start = self.clock.now();
        let Some(record) = tx.pick_task(&self.location, &self.retry_strategy).await? else {
            trace!(queue = %self.location, shard = %self.shard_id, "no task to pick");
            return Ok(None);
        };

        self.listener.picked(
            &self.shard_id,
            &self.location,
            &record,
            self.clock.elapsed_since(start),
        );
        Ok(Some(record))
    }
}
