//! # Database-backed task queue
//!
//! Durable task queues on ordinary SQL tables. Tasks are leased with row locks
//! (`FOR UPDATE SKIP LOCKED`), so any number of pollers can share a table
//! without double delivery, and a crashed consumer loses no work: its task
//! simply becomes visible again when the lease runs out.
//!
//! ## Features
//!
//! - **Lease at pick time**: picking a task bumps its attempt count and moves
//!   its process time forward by the queue's retry delay
//! - **Retry backoff**: geometric, arithmetic or fixed leases; five reenqueue
//!   schedules for tasks the consumer asks to run again
//! - **Processing modes**: separate transactions, one wrapping transaction, or
//!   hand-off to an external executor
//! - **Sharding**: one store per shard, one poll loop per `(shard, queue)`
//! - **Wiring validation**: every registration problem reported at once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    QueueExecutionPool                        │
//! │  (one QueueLoop per shard and queue, graceful shutdown)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueRunner                            │
//! │  TaskPicker → TaskProcessor → consumer → TaskResultHandler  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueStore                            │
//! │  (PostgreSQL or in-memory; one per shard)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use dbqueue::prelude::*;
//!
//! let store: Arc<dyn QueueStore> = Arc::new(PostgresQueueStore::new(shard_id, pool));
//!
//! let mut registry = QueueRegistry::new();
//! registry
//!     .register_shard(store.clone())
//!     .register_queue(consumer, producer);
//!
//! let pool = QueueExecutionPool::new(registry.finish_registration()?, ExecutionPoolConfig::from_env());
//! pool.start()?;
//! ```

pub mod api;
pub mod clock;
pub mod error;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod settings;
pub mod storage;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::api::{
        EnqueueParams, EnqueueResult, JsonPayloadTransformer, NoopPayloadTransformer,
        QueueConsumer, QueueExternalExecutor, QueueProducer, QueueShardRouter,
        ShardedQueueProducer, SingleShardRouter, Task, TaskExecutionResult,
        TaskLifecycleListener, TaskPayloadTransformer, ThreadLifecycleListener,
        TokioExternalExecutor,
    };
    pub use crate::error::QueueError;
    pub use crate::registry::{QueueRegistry, RegisteredQueues, RegistryError};
    pub use crate::settings::{
        ProcessingMode, QueueConfig, QueueLocation, QueueSettings, QueueShardId,
    };
    pub use crate::storage::{InMemoryQueueStore, PostgresQueueStore, QueueStore};
    pub use crate::worker::{ExecutionPoolConfig, PoolError, QueueExecutionPool};
}

// Re-export key types at crate root
pub use api::{QueueConsumer, QueueProducer, Task, TaskExecutionResult};
pub use error::QueueError;
pub use registry::{QueueRegistry, RegisteredQueues, RegistryError};
pub use settings::{QueueConfig, QueueLocation, QueueSettings, QueueShardId};
pub use storage::{InMemoryQueueStore, PostgresQueueStore, QueueStore, StoreError};
pub use worker::{ExecutionPoolConfig, PoolError, QueueExecutionPool};
