//! Lifecycle hooks for tasks and poll loops
//!
//! Hooks run inline on the loop that raised them and must not block. Every
//! method has a no-op default so listeners only implement what they observe.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::result::{QueueProcessingStatus, TaskExecutionResult};
use super::task::TaskRecord;
use crate::error::QueueError;
use crate::settings::{QueueLocation, QueueShardId};

/// Observes one task going through the processor
///
/// For every picked task the calls are `picked`, `started`, then either
/// `executed` or `crashed`, and always `finished` last.
pub trait TaskLifecycleListener: Send + Sync {
    /// The task was leased; `pick_time` is how long the pick took
    fn picked(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        _pick_time: Duration,
    ) {
    }

    fn started(&self, _shard_id: &QueueShardId, _location: &QueueLocation, _record: &TaskRecord) {}

    /// The consumer returned a result; `elapsed` covers the consumer call only
    fn executed(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        _result: &TaskExecutionResult,
        _elapsed: Duration,
    ) {
    }

    /// Payload decoding, the consumer, or recording the outcome failed
    fn crashed(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _record: &TaskRecord,
        _error: &QueueError,
    ) {
    }

    fn finished(&self, _shard_id: &QueueShardId, _location: &QueueLocation, _record: &TaskRecord) {}
}

/// Observes the poll cycles of one `(shard, queue)` loop
///
/// Every cycle calls `started`, then `executed` or `crashed`, and always `finished`.
pub trait ThreadLifecycleListener: Send + Sync {
    fn started(&self, _shard_id: &QueueShardId, _location: &QueueLocation) {}

    fn executed(
        &self,
        _shard_id: &QueueShardId,
        _location: &QueueLocation,
        _status: QueueProcessingStatus,
        _elapsed: Duration,
    ) {
    }

    fn crashed(&self, _shard_id: &QueueShardId, _location: &QueueLocation, _error: &QueueError) {}

    fn finished(&self, _shard_id: &QueueShardId, _location: &QueueLocation) {}
}

/// Listener that ignores everything; used when a queue registers none
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycleListener;

impl TaskLifecycleListener for NoopLifecycleListener {}

impl ThreadLifecycleListener for NoopLifecycleListener {}

/// Reports task events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTaskLifecycleListener;

impl TaskLifecycleListener for LoggingTaskLifecycleListener {
    fn picked(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        pick_time: Duration,
    ) {
        debug!(
            shard = %shard_id,
            queue = %location,
            task_id = record.id,
            attempts = record.attempts_count,
            pick_time_ms = pick_time.as_millis() as u64,
            "task picked"
        );
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        result: &TaskExecutionResult,
        elapsed: Duration,
    ) {
        info!(
            shard = %shard_id,
            queue = %location,
            task_id = record.id,
            result = %result,
            elapsed_ms = elapsed.as_millis() as u64,
            "task executed"
        );
    }

    fn crashed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        error: &QueueError,
    ) {
        warn!(
            shard = %shard_id,
            queue = %location,
            task_id = record.id,
            attempts = record.attempts_count,
            error = %error,
            "task crashed"
        );
    }
}

/// Reports loop crashes through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingThreadLifecycleListener;

impl ThreadLifecycleListener for LoggingThreadLifecycleListener {
    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        status: QueueProcessingStatus,
        elapsed: Duration,
    ) {
        if status == QueueProcessingStatus::Processed {
            debug!(
                shard = %shard_id,
                queue = %location,
                elapsed_ms = elapsed.as_millis() as u64,
                "poll cycle processed a task"
            );
        }
    }

    fn crashed(&self, shard_id: &QueueShardId, location: &QueueLocation, error: &QueueError) {
        warn!(shard = %shard_id, queue = %location, error = %error, "poll cycle crashed");
    }
}
