//! Execution pool: one loop per `(shard, queue)`, graceful shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::queue_loop::{LoopState, QueueLoop, ShutdownLoopPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::registry::RegisteredQueues;
use crate::settings::{duration_millis, QueueLocation, QueueShardId};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Execution pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPoolConfig {
    /// How long `shutdown` waits for loops and external executors
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutionPoolConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ExecutionPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reads `DBQUEUE_SHUTDOWN_TIMEOUT_MS`; unset or malformed keeps the default
    pub fn from_env() -> Self {
        let shutdown_timeout = std::env::var("DBQUEUE_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        Self { shutdown_timeout }
    }
}

/// Execution pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Stopped,
    Running,
    /// Shutdown requested, loops finishing their current cycle
    Draining,
}

/// Execution pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("execution pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// External executors are closed by `shutdown` and cannot take work again
    #[error("external executors were shut down; build a new pool with fresh executors")]
    ExecutorsShutDown,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// State of one loop as seen from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub shard_id: QueueShardId,
    pub location: QueueLocation,
    pub state: LoopState,
}

struct LoopHandle {
    shard_id: QueueShardId,
    location: QueueLocation,
    state_rx: watch::Receiver<LoopState>,
    join: Option<JoinHandle<()>>,
}

/// Runs every registered queue on every shard its router names
///
/// # Example
///
/// ```ignore
/// let registered = registry.finish_registration()?;
/// let pool = QueueExecutionPool::new(registered, ExecutionPoolConfig::from_env());
///
/// pool.start()?;
/// tokio::signal::ctrl_c().await?;
/// pool.shutdown().await?;
/// ```
pub struct QueueExecutionPool {
    queues: RegisteredQueues,
    config: ExecutionPoolConfig,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<PoolStatus>,
    executors_shut_down: AtomicBool,
    loops: Mutex<Vec<LoopHandle>>,
}

impl QueueExecutionPool {
    pub fn new(queues: RegisteredQueues, config: ExecutionPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queues,
            config,
            clock: Arc::new(SystemClock),
            shutdown_tx,
            status: RwLock::new(PoolStatus::Stopped),
            executors_shut_down: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Clock used for elapsed-time measurements
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registered_queues(&self) -> &RegisteredQueues {
        &self.queues
    }

    /// Spawn all loops on the current tokio runtime
    ///
    /// Every runner is built before the first loop is spawned, so on error
    /// nothing is running. A pool whose external executors were shut down
    /// cannot be started again.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), PoolError> {
        let mut status = self.status.write();
        if *status != PoolStatus::Stopped {
            return Err(PoolError::AlreadyRunning);
        }
        if self.executors_shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ExecutorsShutDown);
        }
        self.shutdown_tx.send_replace(false);

        let mut loops = Vec::new();
        for queue in self.queues.queues() {
            let config = queue.config();
            let location = &config.location;
            for shard_id in queue.shard_ids() {
                let store = self
                    .queues
                    .shard(&shard_id)
                    .cloned()
                    .ok_or_else(|| QueueError::ShardNotFound(shard_id.clone()))?;
                let runner = queue.create_runner(
                    store,
                    self.queues.task_listener(location),
                    self.queues.external_executor(location),
                    Arc::clone(&self.clock),
                )?;
                let policy = ShutdownLoopPolicy::new(self.shutdown_tx.subscribe());
                loops.push(
                    QueueLoop::new(shard_id, config.settings.clone(), runner, Box::new(policy))
                        .with_listener(self.queues.thread_listener(location))
                        .with_clock(Arc::clone(&self.clock)),
                );
            }
        }

        info!(loops = loops.len(), "starting queue execution pool");
        let handles = loops
            .into_iter()
            .map(|queue_loop| LoopHandle {
                shard_id: queue_loop.shard_id().clone(),
                location: queue_loop.location().clone(),
                state_rx: queue_loop.subscribe(),
                join: Some(tokio::spawn(queue_loop.run())),
            })
            .collect();
        *self.loops.lock() = handles;
        *status = PoolStatus::Running;

        Ok(())
    }

    /// Stop all loops, then shut down the external executors
    ///
    /// Loops stop at their next wait; a cycle in progress runs to completion.
    /// Loops still running at the deadline are aborted. External executors are
    /// shut down for good; after that `start` fails unless the pool has none.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        {
            let mut status = self.status.write();
            if *status != PoolStatus::Running {
                return Ok(());
            }
            *status = PoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let joins: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .iter_mut()
            .filter_map(|handle| handle.join.take())
            .collect();
        let aborts: Vec<_> = joins.iter().map(JoinHandle::abort_handle).collect();

        let mut timed_out = false;
        match tokio::time::timeout_at(deadline, futures::future::join_all(joins)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "queue loop ended abnormally");
                    }
                }
                debug!("all queue loops stopped");
            }
            Err(_) => {
                warn!("queue loops did not stop in time, aborting");
                aborts.iter().for_each(|abort| abort.abort());
                timed_out = true;
            }
        }

        for executor in self.queues.external_executors() {
            self.executors_shut_down.store(true, Ordering::SeqCst);
            if tokio::time::timeout_at(deadline, executor.shutdown())
                .await
                .is_err()
            {
                warn!("external executor did not drain in time");
                timed_out = true;
            }
        }

        *self.status.write() = PoolStatus::Stopped;
        if timed_out {
            return Err(PoolError::ShutdownTimeout);
        }

        info!("queue execution pool stopped");
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    /// One entry per spawned loop
    pub fn loop_states(&self) -> Vec<LoopStatus> {
        self.loops
            .lock()
            .iter()
            .map(|handle| LoopStatus {
                shard_id: handle.shard_id.clone(),
                location: handle.location.clone(),
                state: *handle.state_rx.borrow(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        NoopPayloadTransformer, QueueConsumer, QueueShardRouter, ShardedQueueProducer,
        SingleShardRouter, Task, TaskExecutionResult, TaskPayloadTransformer,
        TokioExternalExecutor,
    };
    use crate::registry::QueueRegistry;
    use crate::runner::test_support::{config, enqueue, ScriptedConsumer};
    use crate::settings::{ProcessingMode, QueueConfig};
    use crate::storage::{InMemoryQueueStore, QueueStore};
    use async_trait::async_trait;

    fn producer(config: QueueConfig, store: Arc<InMemoryQueueStore>) -> Arc<ShardedQueueProducer<String>> {
        Arc::new(ShardedQueueProducer::new(
            config,
            Arc::new(NoopPayloadTransformer),
            Arc::new(SingleShardRouter::new(QueueShardId::new("main"))),
            [store as Arc<dyn QueueStore>],
        ))
    }

    fn registered<C: QueueConsumer<String>>(
        store: Arc<InMemoryQueueStore>,
        consumer: Arc<C>,
    ) -> RegisteredQueues {
        let config = consumer.queue_config().clone();
        let mut registry = QueueRegistry::new();
        registry
            .register_shard(store.clone())
            .register_queue::<String>(consumer, producer(config, store));
        registry.finish_registration().unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_config_defaults_and_builder() {
        let config = ExecutionPoolConfig::default();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));

        let config = ExecutionPoolConfig::new().with_shutdown_timeout(Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config = ExecutionPoolConfig::new().with_shutdown_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"shutdown_timeout":1500}"#);
        assert_eq!(serde_json::from_str::<ExecutionPoolConfig>(&json).unwrap(), config);
    }

    #[tokio::test]
    async fn test_start_process_and_shutdown() {
        let store = Arc::new(InMemoryQueueStore::new(QueueShardId::new("main")));
        let config = config("pool", ProcessingMode::SeparateTransactions);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        for payload in ["a", "b", "c"] {
            enqueue(store.as_ref(), &config.location, payload).await;
        }

        let pool = QueueExecutionPool::new(
            registered(store.clone(), consumer.clone()),
            ExecutionPoolConfig::new().with_shutdown_timeout(Duration::from_secs(5)),
        );
        pool.start().unwrap();
        assert_eq!(pool.status(), PoolStatus::Running);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        wait_until(|| store.task_count(&config.location) == 0).await;
        assert_eq!(consumer.calls().len(), 3);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert_eq!(
            pool.loop_states(),
            vec![LoopStatus {
                shard_id: QueueShardId::new("main"),
                location: config.location,
                state: LoopState::Stopped,
            }]
        );

        // Second shutdown is a no-op
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let store = Arc::new(InMemoryQueueStore::new(QueueShardId::new("main")));
        let config = config("restart", ProcessingMode::SeparateTransactions);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let pool = QueueExecutionPool::new(
            registered(store.clone(), consumer),
            ExecutionPoolConfig::default(),
        );

        pool.start().unwrap();
        pool.shutdown().await.unwrap();

        enqueue(store.as_ref(), &config.location, "later").await;
        pool.start().unwrap();
        wait_until(|| store.task_count(&config.location) == 0).await;
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_rejected_once_executors_are_shut_down() {
        let store = Arc::new(InMemoryQueueStore::new(QueueShardId::new("main")));
        let config = config("handoff", ProcessingMode::UseExternalExecutor);
        let consumer = Arc::new(ScriptedConsumer::new(config.clone(), |_| {
            Ok(TaskExecutionResult::finish())
        }));
        let mut registry = QueueRegistry::new();
        registry
            .register_shard(store.clone())
            .register_queue::<String>(consumer.clone(), producer(config.clone(), store.clone()))
            .register_external_executor(
                config.location.clone(),
                Arc::new(TokioExternalExecutor::new(2)),
            );
        let pool = QueueExecutionPool::new(
            registry.finish_registration().unwrap(),
            ExecutionPoolConfig::default(),
        );

        enqueue(store.as_ref(), &config.location, "first").await;
        pool.start().unwrap();
        wait_until(|| store.task_count(&config.location) == 0).await;
        pool.shutdown().await.unwrap();

        let id = enqueue(store.as_ref(), &config.location, "after restart").await;
        assert!(matches!(pool.start(), Err(PoolError::ExecutorsShutDown)));
        assert_eq!(pool.status(), PoolStatus::Stopped);

        // Nothing picked the task, so no attempt was spent on it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.find_task(id).unwrap().attempts_count, 0);
        assert_eq!(consumer.calls().len(), 1);
    }

    /// Consumer whose tasks never complete
    struct StuckConsumer {
        config: QueueConfig,
    }

    #[async_trait]
    impl QueueConsumer<String> for StuckConsumer {
        fn queue_config(&self) -> &QueueConfig {
            &self.config
        }

        fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<String>> {
            Arc::new(NoopPayloadTransformer)
        }

        fn shard_router(&self) -> Arc<dyn QueueShardRouter<String>> {
            Arc::new(SingleShardRouter::new(QueueShardId::new("main")))
        }

        async fn execute(&self, _task: Task<String>) -> anyhow::Result<TaskExecutionResult> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_cycle() {
        let store = Arc::new(InMemoryQueueStore::new(QueueShardId::new("main")));
        let config = config("stuck", ProcessingMode::SeparateTransactions);
        enqueue(store.as_ref(), &config.location, "forever").await;

        let pool = QueueExecutionPool::new(
            registered(store.clone(), Arc::new(StuckConsumer { config: config.clone() })),
            ExecutionPoolConfig::new().with_shutdown_timeout(Duration::from_millis(50)),
        );
        pool.start().unwrap();
        wait_until(|| {
            pool.loop_states()
                .iter()
                .all(|status| status.state == LoopState::Running)
                && store.find_task(1).is_some_and(|task| task.attempts_count == 1)
        })
        .await;

        assert!(matches!(
            pool.shutdown().await,
            Err(PoolError::ShutdownTimeout)
        ));
        assert_eq!(pool.status(), PoolStatus::Stopped);
    }
}
