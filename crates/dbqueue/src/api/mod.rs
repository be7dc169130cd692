//! Types shared by queue producers, consumers and their collaborators

mod consumer;
mod equality;
mod executor;
mod listener;
mod producer;
mod result;
mod shard;
mod task;
mod transformer;

pub use consumer::QueueConsumer;
pub use equality::DynEq;
pub use executor::{QueueExternalExecutor, TokioExternalExecutor};
pub use listener::{
    LoggingTaskLifecycleListener, LoggingThreadLifecycleListener, NoopLifecycleListener,
    TaskLifecycleListener, ThreadLifecycleListener,
};
pub use producer::{EnqueueResult, QueueProducer, ShardedQueueProducer};
pub use result::{QueueProcessingStatus, TaskExecutionResult};
pub use shard::{QueueShardRouter, SingleShardRouter};
pub use task::{EnqueueParams, Task, TaskRecord};
pub use transformer::{
    JsonPayloadTransformer, NoopPayloadTransformer, PayloadError, TaskPayloadTransformer,
};
