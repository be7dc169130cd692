//! Task rows and the view consumers receive

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transformer::PayloadError;
use crate::settings::QueueShardId;

/// One row of a queue table, as returned by a pick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Row id, unique within a shard
    pub id: i64,

    /// Serialized payload
    pub payload: Option<String>,

    /// Number of picks since enqueue or the last reenqueue
    pub attempts_count: u32,

    pub create_date: DateTime<Utc>,

    /// Earliest time the row can be picked again; the lease deadline while it is being processed
    pub process_time: DateTime<Utc>,

    pub correlation_id: Option<String>,

    pub actor: Option<String>,
}

/// What a consumer receives for one invocation
#[derive(Debug, Clone)]
pub struct Task<T> {
    shard_id: QueueShardId,
    payload: Option<T>,
    attempts_count: u32,
    create_date: DateTime<Utc>,
    correlation_id: Option<String>,
    actor: Option<String>,
}

impl<T> Task<T> {
    /// Build the consumer view of a picked row
    pub fn from_record(shard_id: QueueShardId, payload: Option<T>, record: &TaskRecord) -> Self {
        Self {
            shard_id,
            payload,
            attempts_count: record.attempts_count,
            create_date: record.create_date,
            correlation_id: record.correlation_id.clone(),
            actor: record.actor.clone(),
        }
    }

    pub fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    /// The payload, or an error when the row had none
    pub fn payload_or_err(&self) -> Result<&T, PayloadError> {
        self.payload.as_ref().ok_or(PayloadError::Missing)
    }

    pub fn into_payload(self) -> Option<T> {
        self.payload
    }

    pub fn attempts_count(&self) -> u32 {
        self.attempts_count
    }

    pub fn create_date(&self) -> DateTime<Utc> {
        self.create_date
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }
}

/// Parameters of one enqueue call
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dbqueue::api::EnqueueParams;
///
/// let params = EnqueueParams::new("send-welcome-mail".to_string())
///     .with_execution_delay(Duration::from_secs(60))
///     .with_correlation_id("req-42")
///     .with_actor("user-7");
///
/// assert_eq!(params.actor.as_deref(), Some("user-7"));
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueParams<T> {
    pub payload: Option<T>,

    /// How long the task stays invisible after enqueue
    pub execution_delay: Duration,

    pub correlation_id: Option<String>,

    pub actor: Option<String>,
}

impl<T> EnqueueParams<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload: Some(payload),
            ..Self::empty()
        }
    }

    /// A task without payload
    pub fn empty() -> Self {
        Self {
            payload: None,
            execution_delay: Duration::ZERO,
            correlation_id: None,
            actor: None,
        }
    }

    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

impl<T> Default for EnqueueParams<T> {
    fn default() -> Self {
        Self::empty()
    }
}
