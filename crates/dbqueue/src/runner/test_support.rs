//! Test doubles shared by the runner and worker tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::{
    NoopPayloadTransformer, QueueConsumer, QueueShardRouter, SingleShardRouter, Task,
    TaskExecutionResult, TaskLifecycleListener, TaskPayloadTransformer, TaskRecord,
};
use crate::error::QueueError;
use crate::settings::{ProcessingMode, QueueConfig, QueueLocation, QueueSettings, QueueShardId};
use crate::storage::{NewTask, QueueStore};

type Script = Box<dyn Fn(&Task<String>) -> anyhow::Result<TaskExecutionResult> + Send + Sync>;

pub(crate) fn config(queue: &str, mode: ProcessingMode) -> QueueConfig {
    QueueConfig::new(
        QueueLocation::new("queue_tasks", queue).unwrap(),
        QueueSettings::new(Duration::from_millis(50), Duration::from_millis(5))
            .with_processing_mode(mode),
    )
}

pub(crate) async fn enqueue(store: &dyn QueueStore, location: &QueueLocation, payload: &str) -> i64 {
    let mut tx = store.begin().await.unwrap();
    let id = tx
        .enqueue(
            location,
            NewTask {
                payload: Some(payload.to_string()),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    id
}

/// String consumer on shard `main` whose verdict comes from a closure
pub(crate) struct ScriptedConsumer {
    config: QueueConfig,
    transformer: Arc<dyn TaskPayloadTransformer<String>>,
    script: Script,
    calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedConsumer {
    pub(crate) fn new(
        config: QueueConfig,
        script: impl Fn(&Task<String>) -> anyhow::Result<TaskExecutionResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            transformer: Arc::new(NoopPayloadTransformer),
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_transformer(
        mut self,
        transformer: Arc<dyn TaskPayloadTransformer<String>>,
    ) -> Self {
        self.transformer = transformer;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl QueueConsumer<String> for ScriptedConsumer {
    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<String>> {
        self.transformer.clone()
    }

    fn shard_router(&self) -> Arc<dyn QueueShardRouter<String>> {
        Arc::new(SingleShardRouter::new(QueueShardId::new("main")))
    }

    async fn execute(&self, task: Task<String>) -> anyhow::Result<TaskExecutionResult> {
        self.calls.lock().push(task.payload().cloned());
        (self.script)(&task)
    }
}

/// Task listener that keeps a readable trace of its calls
#[derive(Default)]
pub(crate) struct RecordingTaskListener {
    events: Mutex<Vec<String>>,
}

impl RecordingTaskListener {
    /// Events after `picked`, which depends on timing
    pub(crate) fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.as_str() != "picked")
            .cloned()
            .collect()
    }

    pub(crate) fn picked_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.as_str() == "picked")
            .count()
    }
}

impl TaskLifecycleListener for RecordingTaskListener {
    fn picked(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        _pick_time: Duration,
    ) {
        self.events.lock().push("picked".to_string());
    }

    fn started(&self, _shard_id: &QueueShardId, _location: &QueueLocation, _record: &TaskRecord) {
        self.events.lock().push("started".to_string());
    }

    fn executed(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        result: &TaskExecutionResult,
        _elapsed: Duration,
    ) {
        self.events.lock().push(format!("executed:{result}"));
    }

    fn crashed(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        error: &QueueError,
    ) {
        self.events.lock().push(format!("crashed:{error}"));
    }

    fn finished(&self, _shard_id: &QueueShardId, _location: &QueueLocation, _record: &TaskRecord) {
        self.events.lock().push("finished".to_string());
    }
}
