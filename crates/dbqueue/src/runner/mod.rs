//! One poll of one queue on one shard
//!
//! A [`QueueRunner`] picks at most one task per call. How the pick, the
//! consumer call and the outcome share transactions depends on the queue's
//! [`ProcessingMode`]:
//!
//! | mode                     | pick                | consumer + outcome          |
//! |--------------------------|---------------------|-----------------------------|
//! | `SEPARATE_TRANSACTIONS`  | own tx, committed   | outcome in a new tx         |
//! | `WRAP_IN_TRANSACTION`    | shared tx           | same tx, committed at end   |
//! | `USE_EXTERNAL_EXECUTOR`  | own tx, committed   | handed to the executor      |

mod picker;
mod processor;
mod result_handler;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::api::{
    QueueConsumer, QueueExternalExecutor, QueueProcessingStatus, TaskLifecycleListener, TaskRecord,
};
use crate::clock::Clock;
use crate::error::QueueError;
use crate::retry::{ReenqueueRetryStrategy, TaskRetryStrategy};
use crate::settings::{ProcessingMode, QueueLocation};
use crate::storage::QueueStore;

pub use picker::TaskPicker;
pub use processor::TaskProcessor;
pub use result_handler::TaskResultHandler;

/// A single poll step
#[async_trait]
pub trait QueueRunner: Send + Sync {
    fn location(&self) -> &QueueLocation;

    /// Pick and handle at most one task
    ///
    /// Errors mean the poll itself failed (storage unreachable, commit
    /// rejected); task failures are reported to the task listener instead.
    async fn run_queue(&self) -> Result<QueueProcessingStatus, QueueError>;
}

/// Build the runner matching the consumer's processing mode
pub fn create_runner<T: Send + 'static>(
    consumer: Arc<dyn QueueConsumer<T>>,
    store: Arc<dyn QueueStore>,
    task_listener: Arc<dyn TaskLifecycleListener>,
    executor: Option<Arc<dyn QueueExternalExecutor>>,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn QueueRunner>, QueueError> {
    let config = consumer.queue_config().clone();
    let shard_id = store.shard_id().clone();

    let picker = TaskPicker::new(
        shard_id.clone(),
        config.location.clone(),
        TaskRetryStrategy::from_settings(&config.settings)?,
        task_listener.clone(),
        clock.clone(),
    );
    let processor = Arc::new(TaskProcessor::new(
        shard_id,
        config.location.clone(),
        task_listener,
        clock,
        TaskResultHandler::new(
            config.location.clone(),
            store.clone(),
            ReenqueueRetryStrategy::from_settings(&config.settings)?,
        ),
    ));
    let parts = RunnerParts {
        location: config.location.clone(),
        consumer,
        store,
        picker,
        processor,
    };

    debug!(
        queue = %config.location,
        mode = %config.settings.processing_mode,
        "creating queue runner"
    );
    Ok(match config.settings.processing_mode {
        ProcessingMode::SeparateTransactions => Box::new(SeparateTransactionsRunner(parts)),
        ProcessingMode::WrapInTransaction => Box::new(WrapInTransactionRunner(parts)),
        ProcessingMode::UseExternalExecutor => {
            let executor = executor.ok_or_else(|| QueueError::ExecutorMissing(config.location))?;
            Box::new(ExternalExecutorRunner { parts, executor })
        }
    })
}

struct RunnerParts<T> {
    location: QueueLocation,
    consumer: Arc<dyn QueueConsumer<T>>,
    store: Arc<dyn QueueStore>,
    picker: TaskPicker,
    processor: Arc<TaskProcessor>,
}

impl<T: Send + 'static> RunnerParts<T> {
    /// Pick in a transaction of its own so the lease is committed before processing
    async fn pick_and_commit(&self) -> Result<Option<TaskRecord>, QueueError> {
        let mut tx = self.store.begin().await?;
        let picked = self.picker.pick_task(tx.as_mut()).await?;
        tx.commit().await?;
        Ok(picked)
    }
}

/// Lease committed first; the outcome is written in a second transaction
///
/// A crash while processing leaves the lease in place, so the task comes back
/// after the retry delay.
pub struct SeparateTransactionsRunner<T>(RunnerParts<T>);

#[async_trait]
impl<T: Send + 'static> QueueRunner for SeparateTransactionsRunner<T> {
    fn location(&self) -> &QueueLocation {
        &self.0.location
    }

    async fn run_queue(&self) -> Result<QueueProcessingStatus, QueueError> {
        let Some(record) = self.0.pick_and_commit().await? else {
            return Ok(QueueProcessingStatus::Skipped);
        };
        self.0
            .processor
            .process_task(self.0.consumer.as_ref(), &record, None)
            .await;
        Ok(QueueProcessingStatus::Processed)
    }
}

/// Pick, consumer call and outcome share one transaction
///
/// The consumer can enlist its own writes only through the store; the
/// transaction commits even when the consumer crashed, which keeps the
/// attempt increment.
pub struct WrapInTransactionRunner<T>(RunnerParts<T>);

#[async_trait]
impl<T: Send + 'static> QueueRunner for WrapInTransactionRunner<T> {
    fn location(&self) -> &QueueLocation {
        &self.0.location
    }

    async fn run_queue(&self) -> Result<QueueProcessingStatus, QueueError> {
        let mut tx = self.0.store.begin().await?;
        let Some(record) = self.0.picker.pick_task(tx.as_mut()).await? else {
            tx.commit().await?;
            return Ok(QueueProcessingStatus::Skipped);
        };
        self.0
            .processor
            .process_task(self.0.consumer.as_ref(), &record, Some(tx.as_mut()))
            .await;
        tx.commit().await?;
        Ok(QueueProcessingStatus::Processed)
    }
}

/// Lease committed, then processing handed to an external executor
///
/// Returns `Processed` as soon as the executor accepts the work.
pub struct ExternalExecutorRunner<T> {
    parts: RunnerParts<T>,
    executor: Arc<dyn QueueExternalExecutor>,
}

#[async_trait]
impl<T: Send + 'static> QueueRunner for ExternalExecutorRunner<T> {
    fn location(&self) -> &QueueLocation {
        &self.parts.location
    }

    async fn run_queue(&self) -> Result<QueueProcessingStatus, QueueError> {
        let Some(record) = self.parts.pick_and_commit().await? else {
            return Ok(QueueProcessingStatus::Skipped);
        };

        let consumer = Arc::clone(&self.parts.consumer);
        let processor = Arc::clone(&self.parts.processor);
        self.executor
            .execute(
                async move {
                    processor
                        .process_task(consumer.as_ref(), &record, None)
                        .await;
                }
                .boxed(),
            )
            .await?;
        Ok(QueueProcessingStatus::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{config, enqueue, RecordingTaskListener, ScriptedConsumer};
    use super::*;
    use crate::api::{TaskExecutionResult, TokioExternalExecutor};
    use crate::clock::ManualClock;
    use crate::settings::QueueShardId;
    use crate::storage::InMemoryQueueStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryQueueStore>,
        listener: Arc<RecordingTaskListener>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        Fixture {
            store: Arc::new(InMemoryQueueStore::with_clock(
                QueueShardId::new("main"),
                clock.clone(),
            )),
            listener: Arc::new(RecordingTaskListener::default()),
            clock,
        }
    }

    fn runner(
        f: &Fixture,
        consumer: Arc<ScriptedConsumer>,
        executor: Option<Arc<dyn QueueExternalExecutor>>,
    ) -> Result<Box<dyn QueueRunner>, QueueError> {
        create_runner::<String>(
            consumer,
            f.store.clone(),
            f.listener.clone(),
            executor,
            f.clock.clone(),
        )
    }

    #[tokio::test]
    async fn test_separate_transactions_skip_then_process() {
        let f = fixture();
        let config = config("separate", ProcessingMode::SeparateTransactions);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let runner = runner(&f, consumer.clone(), None).unwrap();

        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Skipped);

        let id = enqueue(f.store.as_ref(), &config.location, "job").await;
        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Processed);

        assert!(f.store.find_task(id).is_none());
        assert_eq!(consumer.calls(), vec![Some("job".to_string())]);
        assert_eq!(f.listener.picked_count(), 1);
    }

    #[tokio::test]
    async fn test_separate_transactions_keep_lease_after_crash() {
        let f = fixture();
        let config = config("separate", ProcessingMode::SeparateTransactions);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Err(anyhow::anyhow!("boom"))
        }));
        let runner = runner(&f, consumer, None).unwrap();
        let id = enqueue(f.store.as_ref(), &config.location, "job").await;

        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Processed);

        // Geometric backoff: first lease is one minute
        let stored = f.store.find_task(id).unwrap();
        assert_eq!(stored.attempts_count, 1);
        assert_eq!(stored.process_time, f.clock.now() + chrono::Duration::minutes(1));
        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Skipped);
    }

    #[tokio::test]
    async fn test_wrap_in_transaction_commits_outcome() {
        let f = fixture();
        let config = config("wrapped", ProcessingMode::WrapInTransaction);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::reenqueue_with_delay(Duration::from_secs(5)))
        }));
        let runner = runner(&f, consumer, None).unwrap();
        let id = enqueue(f.store.as_ref(), &config.location, "job").await;

        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Processed);

        let stored = f.store.find_task(id).unwrap();
        assert_eq!(stored.attempts_count, 0);
        assert_eq!(stored.process_time, f.clock.now() + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_wrap_in_transaction_keeps_attempt_after_crash() {
        let f = fixture();
        let config = config("wrapped", ProcessingMode::WrapInTransaction);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            panic!("consumer bug")
        }));
        let runner = runner(&f, consumer, None).unwrap();
        let id = enqueue(f.store.as_ref(), &config.location, "job").await;

        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Processed);

        assert_eq!(f.store.find_task(id).unwrap().attempts_count, 1);
        assert!(f
            .listener
            .events()
            .contains(&"crashed:panicked: consumer bug".to_string()));
    }

    #[tokio::test]
    async fn test_store_failure_fails_the_poll() {
        let f = fixture();
        let config = config("separate", ProcessingMode::SeparateTransactions);
        let consumer = Arc::new(ScriptedConsumer::new(config, |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let runner = runner(&f, consumer, None).unwrap();
        f.store.set_unavailable(true);

        assert!(matches!(runner.run_queue().await, Err(QueueError::Store(_))));
    }

    #[tokio::test]
    async fn test_external_executor_required() {
        let f = fixture();
        let config = config("external", ProcessingMode::UseExternalExecutor);
        let consumer = Arc::new(ScriptedConsumer::new(config, |_| {
            Ok(TaskExecutionResult::finish())
        }));

        assert!(matches!(
            runner(&f, consumer, None),
            Err(QueueError::ExecutorMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_external_executor_processes_off_the_loop() {
        let f = fixture();
        let config = config("external", ProcessingMode::UseExternalExecutor);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let executor = Arc::new(TokioExternalExecutor::new(2));
        let runner = runner(&f, consumer.clone(), Some(executor.clone() as Arc<dyn QueueExternalExecutor>)).unwrap();
        let id = enqueue(f.store.as_ref(), &config.location, "job").await;

        assert_eq!(runner.run_queue().await.unwrap(), QueueProcessingStatus::Processed);
        executor.shutdown().await;

        assert!(f.store.find_task(id).is_none());
        assert_eq!(consumer.calls(), vec![Some("job".to_string())]);
    }

    #[tokio::test]
    async fn test_rejected_handoff_fails_the_poll() {
        let f = fixture();
        let config = config("external", ProcessingMode::UseExternalExecutor);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let executor = Arc::new(TokioExternalExecutor::new(1));
        executor.shutdown().await;
        let runner = runner(&f, consumer.clone(), Some(executor as Arc<dyn QueueExternalExecutor>)).unwrap();
        let id = enqueue(f.store.as_ref(), &config.location, "job").await;

        assert!(matches!(
            runner.run_queue().await,
            Err(QueueError::ExecutorRejected(_))
        ));
        assert!(consumer.calls().is_empty());
        assert_eq!(f.store.find_task(id).unwrap().attempts_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_retry_settings_rejected() {
        let f = fixture();
        let mut config = config("fixed", ProcessingMode::SeparateTransactions);
        config.settings = config
            .settings
            .with_retry_type(crate::settings::TaskRetryType::FixedInterval);
        let consumer = Arc::new(ScriptedConsumer::new(config, |_| {
            Ok(TaskExecutionResult::finish())
        }));

        assert!(matches!(
            runner(&f, consumer, None),
            Err(QueueError::Config(_))
        ));
    }
}
