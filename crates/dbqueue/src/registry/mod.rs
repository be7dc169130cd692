//! Startup wiring of queues, shards, listeners and executors
//!
//! [`QueueRegistry`] collects everything; [`QueueRegistry::finish_registration`]
//! validates the whole wiring at once and returns the read-only
//! [`RegisteredQueues`] the execution pool is built from. Every problem found
//! is reported, not just the first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::api::{
    NoopLifecycleListener, QueueConsumer, QueueExternalExecutor, QueueProducer,
    TaskLifecycleListener, ThreadLifecycleListener,
};
use crate::clock::Clock;
use crate::error::QueueError;
use crate::retry::{ReenqueueRetryStrategy, TaskRetryStrategy};
use crate::runner::{create_runner, QueueRunner};
use crate::settings::{ProcessingMode, QueueConfig, QueueLocation, QueueShardId};
use crate::storage::QueueStore;

/// Wiring rejected by `finish_registration`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid queue configuration:\n{}", .0.join("\n"))]
    InvalidConfiguration(Vec<String>),
}

impl RegistryError {
    pub fn problems(&self) -> &[String] {
        match self {
            Self::InvalidConfiguration(problems) => problems,
        }
    }
}

/// A registered consumer with its payload type erased
pub(crate) trait AnyQueue: Send + Sync {
    fn config(&self) -> &QueueConfig;

    fn shard_ids(&self) -> Vec<QueueShardId>;

    fn create_runner(
        &self,
        store: Arc<dyn QueueStore>,
        task_listener: Arc<dyn TaskLifecycleListener>,
        executor: Option<Arc<dyn QueueExternalExecutor>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn QueueRunner>, QueueError>;
}

struct ConsumerQueue<T: Send + 'static> {
    consumer: Arc<dyn QueueConsumer<T>>,
}

impl<T: Send + 'static> AnyQueue for ConsumerQueue<T> {
    fn config(&self) -> &QueueConfig {
        self.consumer.queue_config()
    }

    fn shard_ids(&self) -> Vec<QueueShardId> {
        self.consumer.shard_router().shard_ids()
    }

    fn create_runner(
        &self,
        store: Arc<dyn QueueStore>,
        task_listener: Arc<dyn TaskLifecycleListener>,
        executor: Option<Arc<dyn QueueExternalExecutor>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn QueueRunner>, QueueError> {
        create_runner(
            Arc::clone(&self.consumer),
            store,
            task_listener,
            executor,
            clock,
        )
    }
}

/// Collects queue wiring before the pool starts
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use dbqueue::registry::{QueueRegistry, RegistryError};
/// use dbqueue::settings::QueueShardId;
/// use dbqueue::storage::InMemoryQueueStore;
///
/// let mut registry = QueueRegistry::new();
/// registry.register_shard(Arc::new(InMemoryQueueStore::new(QueueShardId::new("main"))));
///
/// // A shard no queue routes to is a wiring error
/// let err = registry.finish_registration().unwrap_err();
/// assert_eq!(err.problems(), ["shards is not used: shardIds=main"]);
/// ```
#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<QueueLocation, Arc<dyn AnyQueue>>,
    shards: BTreeMap<QueueShardId, Arc<dyn QueueStore>>,
    task_listeners: BTreeMap<QueueLocation, Arc<dyn TaskLifecycleListener>>,
    thread_listeners: BTreeMap<QueueLocation, Arc<dyn ThreadLifecycleListener>>,
    executors: BTreeMap<QueueLocation, Arc<dyn QueueExternalExecutor>>,
    errors: Vec<String>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the consumer and producer of one queue
    ///
    /// Both must carry equal config, payload transformer and shard router.
    pub fn register_queue<T: Send + Sync + 'static>(
        &mut self,
        consumer: Arc<dyn QueueConsumer<T>>,
        producer: Arc<dyn QueueProducer<T>>,
    ) -> &mut Self {
        let config = consumer.queue_config();
        let location = config.location.clone();

        if config != producer.queue_config() {
            self.errors
                .push(format!("queue config must be the same: location={location}"));
        }
        if *consumer.payload_transformer() != *producer.payload_transformer() {
            self.errors
                .push(format!("payload transformers must be the same: location={location}"));
        }
        if *consumer.shard_router() != *producer.shard_router() {
            self.errors
                .push(format!("shard routers must be the same: location={location}"));
        }
        if let Err(e) = TaskRetryStrategy::from_settings(&config.settings) {
            self.errors
                .push(format!("invalid task retry settings: location={location}, error={e}"));
        }
        if let Err(e) = ReenqueueRetryStrategy::from_settings(&config.settings) {
            self.errors.push(format!(
                "invalid reenqueue retry settings: location={location}, error={e}"
            ));
        }

        if self.queues.contains_key(&location) {
            self.errors
                .push(format!("duplicate queue: location={location}"));
            return self;
        }
        if let Some(other) = self
            .queues
            .keys()
            .find(|other| other.queue_name() == location.queue_name())
        {
            self.errors.push(format!(
                "queue name must be unique: queueName={}, locations={other},{location}",
                location.queue_name()
            ));
        }

        self.queues
            .insert(location, Arc::new(ConsumerQueue { consumer }));
        self
    }

    pub fn register_shard(&mut self, store: Arc<dyn QueueStore>) -> &mut Self {
        let shard_id = store.shard_id().clone();
        if self.shards.contains_key(&shard_id) {
            self.errors
                .push(format!("duplicate shard: shardId={shard_id}"));
        } else {
            self.shards.insert(shard_id, store);
        }
        self
    }

    pub fn register_task_lifecycle_listener(
        &mut self,
        location: QueueLocation,
        listener: Arc<dyn TaskLifecycleListener>,
    ) -> &mut Self {
        register_unique(
            &mut self.task_listeners,
            &mut self.errors,
            "task lifecycle listener",
            location,
            listener,
        );
        self
    }

    pub fn register_thread_lifecycle_listener(
        &mut self,
        location: QueueLocation,
        listener: Arc<dyn ThreadLifecycleListener>,
    ) -> &mut Self {
        register_unique(
            &mut self.thread_listeners,
            &mut self.errors,
            "thread lifecycle listener",
            location,
            listener,
        );
        self
    }

    /// Required for, and only allowed on, `USE_EXTERNAL_EXECUTOR` queues
    pub fn register_external_executor(
        &mut self,
        location: QueueLocation,
        executor: Arc<dyn QueueExternalExecutor>,
    ) -> &mut Self {
        register_unique(
            &mut self.executors,
            &mut self.errors,
            "external executor",
            location,
            executor,
        );
        self
    }

    /// Validate the wiring and freeze it
    pub fn finish_registration(self) -> Result<RegisteredQueues, RegistryError> {
        let mut errors = self.errors;

        let mut used = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for queue in self.queues.values() {
            for shard_id in queue.shard_ids() {
                if !self.shards.contains_key(&shard_id) {
                    missing.insert(shard_id.clone());
                }
                used.insert(shard_id);
            }
        }
        errors.extend(
            missing
                .iter()
                .map(|shard_id| format!("shard not found: shardId={shard_id}")),
        );
        let unused: Vec<String> = self
            .shards
            .keys()
            .filter(|shard_id| !used.contains(*shard_id))
            .map(ToString::to_string)
            .collect();
        if !unused.is_empty() {
            errors.push(format!("shards is not used: shardIds={}", unused.join(",")));
        }

        for (location, queue) in &self.queues {
            let external =
                queue.config().settings.processing_mode == ProcessingMode::UseExternalExecutor;
            match (external, self.executors.contains_key(location)) {
                (true, false) => errors.push(format!(
                    "external executor missing for processing mode USE_EXTERNAL_EXECUTOR: location={location}"
                )),
                (false, true) => errors.push(format!(
                    "external executor must be specified only for processing mode USE_EXTERNAL_EXECUTOR: location={location}"
                )),
                _ => {}
            }
        }

        let orphans = [
            ("task listener", self.task_listeners.keys().collect::<Vec<_>>()),
            ("thread listener", self.thread_listeners.keys().collect()),
            ("external executor", self.executors.keys().collect()),
        ];
        for (kind, locations) in orphans {
            errors.extend(
                locations
                    .into_iter()
                    .filter(|location| !self.queues.contains_key(*location))
                    .map(|location| format!("no matching queue for {kind}: location={location}")),
            );
        }

        if !errors.is_empty() {
            return Err(RegistryError::InvalidConfiguration(errors));
        }

        for (location, queue) in &self.queues {
            info!(
                queue = %location,
                mode = %queue.config().settings.processing_mode,
                shards = ?queue.shard_ids(),
                "registered queue consumer"
            );
        }
        for shard_id in self.shards.keys() {
            info!(shard = %shard_id, "registered shard");
        }
        for location in self.task_listeners.keys() {
            info!(queue = %location, "registered task lifecycle listener");
        }
        for location in self.thread_listeners.keys() {
            info!(queue = %location, "registered thread lifecycle listener");
        }
        for location in self.executors.keys() {
            info!(queue = %location, "registered external executor");
        }

        Ok(RegisteredQueues {
            queues: self.queues,
            shards: self.shards,
            task_listeners: self.task_listeners,
            thread_listeners: self.thread_listeners,
            executors: self.executors,
        })
    }
}

fn register_unique<V>(
    entries: &mut BTreeMap<QueueLocation, V>,
    errors: &mut Vec<String>,
    kind: &str,
    location: QueueLocation,
    value: V,
) {
    if entries.contains_key(&location) {
        errors.push(format!("duplicate {kind}: location={location}"));
    } else {
        entries.insert(location, value);
    }
}

/// Validated wiring, read-only
pub struct RegisteredQueues {
    queues: BTreeMap<QueueLocation, Arc<dyn AnyQueue>>,
    shards: BTreeMap<QueueShardId, Arc<dyn QueueStore>>,
    task_listeners: BTreeMap<QueueLocation, Arc<dyn TaskLifecycleListener>>,
    thread_listeners: BTreeMap<QueueLocation, Arc<dyn ThreadLifecycleListener>>,
    executors: BTreeMap<QueueLocation, Arc<dyn QueueExternalExecutor>>,
}

impl fmt::Debug for RegisteredQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredQueues")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RegisteredQueues {
    pub fn queue_configs(&self) -> impl Iterator<Item = &QueueConfig> {
        self.queues.values().map(|queue| queue.config())
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = &QueueShardId> {
        self.shards.keys()
    }

    pub fn shard(&self, shard_id: &QueueShardId) -> Option<&Arc<dyn QueueStore>> {
        self.shards.get(shard_id)
    }

    /// Falls back to a no-op listener
    pub fn task_listener(&self, location: &QueueLocation) -> Arc<dyn TaskLifecycleListener> {
        self.task_listeners
            .get(location)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopLifecycleListener))
    }

    /// Falls back to a no-op listener
    pub fn thread_listener(&self, location: &QueueLocation) -> Arc<dyn ThreadLifecycleListener> {
        self.thread_listeners
            .get(location)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopLifecycleListener))
    }

    pub fn external_executor(
        &self,
        location: &QueueLocation,
    ) -> Option<Arc<dyn QueueExternalExecutor>> {
        self.executors.get(location).cloned()
    }

    pub fn external_executors(&self) -> impl Iterator<Item = &Arc<dyn QueueExternalExecutor>> {
        self.executors.values()
    }

    pub(crate) fn queues(&self) -> impl Iterator<Item = &Arc<dyn AnyQueue>> {
        self.queues.values()
    }
}
