//! Poll loops and the pool that runs them
//!
//! - [`QueueLoop`]: polls one queue on one shard, sleeping between polls
//! - [`QueueExecutionPool`]: spawns a loop per `(shard, queue)` and shuts them down

mod pool;
mod queue_loop;

pub use pool::{ExecutionPoolConfig, LoopStatus, PoolError, PoolStatus, QueueExecutionPool};
pub use queue_loop::{LoopPolicy, LoopState, QueueLoop, ShutdownLoopPolicy};
