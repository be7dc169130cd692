//! Error raised when a poll cycle or a task invocation crashes

use std::any::Any;

use crate::api::PayloadError;
use crate::retry::RetryError;
use crate::settings::{ConfigError, QueueLocation, QueueShardId};
use crate::storage::StoreError;

/// Why a task or a poll cycle crashed
///
/// Passed to the `crashed` lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The consumer returned an error
    #[error("consumer failed: {0:#}")]
    Consumer(anyhow::Error),

    /// Consumer or runner code panicked
    #[error("panicked: {0}")]
    Panic(String),

    #[error("shard not found: {0}")]
    ShardNotFound(QueueShardId),

    #[error("external executor missing for queue {0}")]
    ExecutorMissing(QueueLocation),

    #[error("external executor rejected the task: {0}")]
    ExecutorRejected(String),
}

impl QueueError {
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = panic.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = panic.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panic(message)
    }
}
