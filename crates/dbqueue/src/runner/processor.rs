//! Runs the consumer on one leased task

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use super::result_handler::TaskResultHandler;
use crate::api::{QueueConsumer, Task, TaskLifecycleListener, TaskRecord};
use crate::clock::Clock;
use crate::error::QueueError;
use crate::settings::{QueueLocation, QueueShardId};
use crate::storage::StoreTransaction;

/// Decodes the payload, invokes the consumer and records its verdict
///
/// Nothing escapes `process_task`: decoding errors, consumer errors, panics and
/// storage failures all end up in the `crashed` hook. The task then stays
/// leased and is picked again once its process time passes.
pub struct TaskProcessor {
    shard_id: QueueShardId,
    location: QueueLocation,
    listener: Arc<dyn TaskLifecycleListener>,
    clock: Arc<dyn Clock>,
    result_handler: TaskResultHandler,
}

impl TaskProcessor {
    pub fn new(
        shard_id: QueueShardId,
        location: QueueLocation,
        listener: Arc<dyn TaskLifecycleListener>,
        clock: Arc<dyn Clock>,
        result_handler: TaskResultHandler,
    ) -> Self {
        Self {
            shard_id,
            location,
            listener,
            clock,
            result_handler,
        }
    }

    pub async fn process_task<T: Send + 'static>(
        &self,
        consumer: &dyn QueueConsumer<T>,
        record: &TaskRecord,
        tx: Option<&mut dyn StoreTransaction>,
    ) {
        self.listener.started(&self.shard_id, &self.location, record);

        let outcome = AssertUnwindSafe(self.execute(consumer, record, tx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(QueueError::from_panic(panic)));

        if let Err(error) = &outcome {
            self.listener
                .crashed(&self.shard_id, &self.location, record, error);
        }
        self.listener.finished(&self.shard_id, &self.location, record);
    }

    async fn execute<T: Send + 'static>(
        &self,
        consumer: &dyn QueueConsumer<T>,
        record: &TaskRecord,
        tx: Option<&mut dyn StoreTransaction>,
    ) -> Result<(), QueueError> {
        let payload = consumer
            .payload_transformer()
            .to_object(record.payload.as_deref())?;
        let task = Task::from_record(self.shard_id.clone(), payload, record);

        let start = self.clock.now();
        let result = consumer.execute(task).await.map_err(QueueError::Consumer)?;
        self.listener.executed(
            &self.shard_id,
            &self.location,
            record,
            &result,
            self.clock.elapsed_since(start),
        );

        self.result_handler.handle_result(record, result, tx).await
    }
}
