//! Consumer side of a queue

use std::sync::Arc;

use async_trait::async_trait;

use super::result::TaskExecutionResult;
use super::shard::QueueShardRouter;
use super::task::Task;
use super::transformer::TaskPayloadTransformer;
use crate::settings::QueueConfig;

/// Business logic that processes the tasks of one queue
///
/// Delivery is at least once: a task whose outcome is never recorded (the
/// process died, `execute` returned an error or panicked) is picked again
/// when its lease runs out. Use the correlation id to deduplicate.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use dbqueue::api::{
///     NoopPayloadTransformer, QueueConsumer, QueueShardRouter, SingleShardRouter, Task,
///     TaskExecutionResult, TaskPayloadTransformer,
/// };
/// use dbqueue::settings::{QueueConfig, QueueShardId};
///
/// struct MailConsumer {
///     config: QueueConfig,
/// }
///
/// #[async_trait]
/// impl QueueConsumer<String> for MailConsumer {
///     fn queue_config(&self) -> &QueueConfig {
///         &self.config
///     }
///
///     fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<String>> {
///         Arc::new(NoopPayloadTransformer)
///     }
///
///     fn shard_router(&self) -> Arc<dyn QueueShardRouter<String>> {
///         Arc::new(SingleShardRouter::new(QueueShardId::new("main")))
///     }
///
///     async fn execute(&self, task: Task<String>) -> anyhow::Result<TaskExecutionResult> {
///         let _address = task.payload_or_err()?;
///         Ok(TaskExecutionResult::finish())
///     }
/// }
/// ```
#[async_trait]
pub trait QueueConsumer<T: Send + 'static>: Send + Sync + 'static {
    fn queue_config(&self) -> &QueueConfig;

    fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<T>>;

    /// Also decides which shards this consumer polls
    fn shard_router(&self) -> Arc<dyn QueueShardRouter<T>>;

    async fn execute(&self, task: Task<T>) -> anyhow::Result<TaskExecutionResult>;
}
