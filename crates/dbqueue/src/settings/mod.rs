//! Queue configuration: where a queue lives and how it is processed

mod iso_duration;
mod location;
mod queue_settings;

pub use iso_duration::{format_iso_duration, parse_iso_duration, InvalidIsoDuration};
pub use location::{QueueLocation, QueueShardId};
pub use queue_settings::{
    ProcessingMode, QueueSettings, ReenqueueRetryType, TaskRetryType,
    REENQUEUE_RETRY_DELAY, REENQUEUE_RETRY_INITIAL_DELAY, REENQUEUE_RETRY_RATIO,
    REENQUEUE_RETRY_SEQUENCE, REENQUEUE_RETRY_STEP, RETRY_FIXED_INTERVAL_DELAY,
};

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid queue location: {0}")]
    InvalidLocation(String),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("invalid setting {key}={value:?}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid environment variable {name}={value:?}: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },
}

/// Location and settings of one queue
///
/// The unit producer and consumer must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub location: QueueLocation,
    pub settings: QueueSettings,
}

impl QueueConfig {
    pub fn new(location: QueueLocation, settings: QueueSettings) -> Self {
        Self { location, settings }
    }

    pub fn location(&self) -> &QueueLocation {
        &self.location
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
