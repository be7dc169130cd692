//! Producer side of a queue

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::shard::QueueShardRouter;
use super::task::EnqueueParams;
use super::transformer::TaskPayloadTransformer;
use crate::error::QueueError;
use crate::settings::{QueueConfig, QueueShardId};
use crate::storage::{NewTask, QueueStore};

/// Where an enqueued task was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    pub shard_id: QueueShardId,
    pub enqueue_id: i64,
}

/// Puts tasks into one queue
#[async_trait]
pub trait QueueProducer<T: Send + Sync + 'static>: Send + Sync {
    fn queue_config(&self) -> &QueueConfig;

    fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<T>>;

    fn shard_router(&self) -> Arc<dyn QueueShardRouter<T>>;

    async fn enqueue(&self, params: EnqueueParams<T>) -> Result<EnqueueResult, QueueError>;
}

/// Producer that routes each task to a shard and inserts it in its own transaction
pub struct ShardedQueueProducer<T> {
    config: QueueConfig,
    payload_transformer: Arc<dyn TaskPayloadTransformer<T>>,
    shard_router: Arc<dyn QueueShardRouter<T>>,
    stores: HashMap<QueueShardId, Arc<dyn QueueStore>>,
}

impl<T: Send + Sync + 'static> ShardedQueueProducer<T> {
    /// `stores` must cover every shard the router can return
    pub fn new(
        config: QueueConfig,
        payload_transformer: Arc<dyn TaskPayloadTransformer<T>>,
        shard_router: Arc<dyn QueueShardRouter<T>>,
        stores: impl IntoIterator<Item = Arc<dyn QueueStore>>,
    ) -> Self {
        let stores = stores
            .into_iter()
            .map(|store| (store.shard_id().clone(), store))
            .collect();
        Self {
            config,
            payload_transformer,
            shard_router,
            stores,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> QueueProducer<T> for ShardedQueueProducer<T> {
    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<T>> {
        Arc::clone(&self.payload_transformer)
    }

    fn shard_router(&self) -> Arc<dyn QueueShardRouter<T>> {
        Arc::clone(&self.shard_router)
    }

    async fn enqueue(&self, params: EnqueueParams<T>) -> Result<EnqueueResult, QueueError> {
        let shard_id = self.shard_router.resolve_shard_id(&params);
        let store = self
            .stores
            .get(&shard_id)
            .ok_or_else(|| QueueError::ShardNotFound(shard_id.clone()))?;
        let payload = self
            .payload_transformer
            .from_object(params.payload.as_ref())?;

        let task = NewTask {
            payload,
            execution_delay: params.execution_delay,
            correlation_id: params.correlation_id,
            actor: params.actor,
        };

        let location = &self.config.location;
        let mut tx = store.begin().await?;
        let enqueue_id = tx.enqueue(location, task).await?;
        tx.commit().await?;

        debug!(
            queue = %location,
            shard = %shard_id,
            task_id = enqueue_id,
            "enqueued task"
        );

        Ok(EnqueueResult {
            shard_id,
            enqueue_id,
        })
    }
}
