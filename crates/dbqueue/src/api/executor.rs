//! Worker pools for queues in `USE_EXTERNAL_EXECUTOR` mode

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::QueueError;

/// Runs task processing off the poll loop
///
/// `execute` should return once the work is accepted, not when it is done; the
/// loop polls again right away, so the executor's own limit is what bounds
/// parallelism for the queue.
#[async_trait]
pub trait QueueExternalExecutor: Send + Sync {
    async fn execute(&self, work: BoxFuture<'static, ()>) -> Result<(), QueueError>;

    /// Called once when the owning pool shuts down
    async fn shutdown(&self) {}
}

/// Executor on the tokio runtime with a fixed concurrency limit
///
/// `execute` waits for a free slot, then spawns the work.
///
/// # Example
///
/// ```
/// use dbqueue::api::TokioExternalExecutor;
///
/// let executor = TokioExternalExecutor::new(8);
/// assert_eq!(executor.max_concurrency(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct TokioExternalExecutor {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    max_concurrency: usize,
}

impl TokioExternalExecutor {
    /// A limit of 0 is raised to 1
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker: TaskTracker::new(),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Work items spawned and not yet finished
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl QueueExternalExecutor for TokioExternalExecutor {
    async fn execute(&self, work: BoxFuture<'static, ()>) -> Result<(), QueueError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| QueueError::ExecutorRejected("executor is shut down".to_string()))?;

        self.tracker.spawn(async move {
            work.await;
            drop(permit);
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.permits.close();
        self.tracker.close();
        debug!(active = self.tracker.len(), "waiting for executor tasks");
        self.tracker.wait().await;
    }
}
