//! Per-queue runtime settings

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::iso_duration::parse_iso_duration;
use super::{duration_millis, ConfigError};

/// Delay of the `FIXED_INTERVAL` task retry strategy (ISO-8601)
pub const RETRY_FIXED_INTERVAL_DELAY: &str = "RETRY_FIXED_INTERVAL_DELAY";
/// Delay of the `FIXED` reenqueue strategy (ISO-8601)
pub const REENQUEUE_RETRY_DELAY: &str = "REENQUEUE_RETRY_DELAY";
/// Comma-separated delays of the `SEQUENTIAL` reenqueue strategy
pub const REENQUEUE_RETRY_SEQUENCE: &str = "REENQUEUE_RETRY_SEQUENCE";
/// First delay of the `ARITHMETIC` and `GEOMETRIC` reenqueue strategies
pub const REENQUEUE_RETRY_INITIAL_DELAY: &str = "REENQUEUE_RETRY_INITIAL_DELAY";
/// Step of the `ARITHMETIC` reenqueue strategy
pub const REENQUEUE_RETRY_STEP: &str = "REENQUEUE_RETRY_STEP";
/// Integer ratio of the `GEOMETRIC` reenqueue strategy
pub const REENQUEUE_RETRY_RATIO: &str = "REENQUEUE_RETRY_RATIO";

const DEFAULT_FATAL_CRASH_TIMEOUT: Duration = Duration::from_secs(1);

fn default_fatal_crash_timeout() -> Duration {
    DEFAULT_FATAL_CRASH_TIMEOUT
}

/// Transaction and execution boundary a queue runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    /// Pick and outcome run in separate transactions
    #[default]
    SeparateTransactions,
    /// Pick, consumer and outcome share one transaction
    WrapInTransaction,
    /// Pick on the loop, hand processing to an external executor
    UseExternalExecutor,
}

/// Pick-time backoff, i.e. the lease granted on every pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRetryType {
    #[default]
    GeometricBackoff,
    ArithmeticBackoff,
    FixedInterval,
}

/// Delay used when a consumer asks to reenqueue without an explicit delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReenqueueRetryType {
    /// Consumers must always pass a delay
    #[default]
    Manual,
    Fixed,
    Sequential,
    Arithmetic,
    Geometric,
}

macro_rules! screaming_enum_text {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown value {other:?}, expected one of: {}",
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

screaming_enum_text!(ProcessingMode {
    SeparateTransactions => "SEPARATE_TRANSACTIONS",
    WrapInTransaction => "WRAP_IN_TRANSACTION",
    UseExternalExecutor => "USE_EXTERNAL_EXECUTOR",
});

screaming_enum_text!(TaskRetryType {
    GeometricBackoff => "GEOMETRIC_BACKOFF",
    ArithmeticBackoff => "ARITHMETIC_BACKOFF",
    FixedInterval => "FIXED_INTERVAL",
});

screaming_enum_text!(ReenqueueRetryType {
    Manual => "MANUAL",
    Fixed => "FIXED",
    Sequential => "SEQUENTIAL",
    Arithmetic => "ARITHMETIC",
    Geometric => "GEOMETRIC",
});

/// Settings of one queue
///
/// Producer and consumer of a queue must hold equal settings.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dbqueue::settings::{ProcessingMode, QueueSettings, TaskRetryType, RETRY_FIXED_INTERVAL_DELAY};
///
/// let settings = QueueSettings::new(Duration::from_secs(1), Duration::from_millis(10))
///     .with_processing_mode(ProcessingMode::WrapInTransaction)
///     .with_retry_type(TaskRetryType::FixedInterval)
///     .with_setting(RETRY_FIXED_INTERVAL_DELAY, "PT30S");
///
/// assert_eq!(settings.fatal_crash_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Wait after a poll that found nothing
    #[serde(with = "duration_millis")]
    pub no_task_timeout: Duration,

    /// Wait after a poll that processed a task
    #[serde(with = "duration_millis")]
    pub between_task_timeout: Duration,

    /// Wait after a poll cycle crashed
    #[serde(with = "duration_millis", default = "default_fatal_crash_timeout")]
    pub fatal_crash_timeout: Duration,

    #[serde(default)]
    pub processing_mode: ProcessingMode,

    #[serde(default)]
    pub retry_type: TaskRetryType,

    #[serde(default)]
    pub reenqueue_retry_type: ReenqueueRetryType,

    /// Strategy parameters, keyed by the `*_DELAY`/`*_SEQUENCE`/... constants
    #[serde(default)]
    pub additional_settings: BTreeMap<String, String>,
}

impl QueueSettings {
    pub fn new(no_task_timeout: Duration, between_task_timeout: Duration) -> Self {
        Self {
            no_task_timeout,
            between_task_timeout,
            fatal_crash_timeout: DEFAULT_FATAL_CRASH_TIMEOUT,
            processing_mode: ProcessingMode::default(),
            retry_type: TaskRetryType::default(),
            reenqueue_retry_type: ReenqueueRetryType::default(),
            additional_settings: BTreeMap::new(),
        }
    }

    pub fn with_fatal_crash_timeout(mut self, timeout: Duration) -> Self {
        self.fatal_crash_timeout = timeout;
        self
    }

    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn with_retry_type(mut self, retry_type: TaskRetryType) -> Self {
        self.retry_type = retry_type;
        self
    }

    pub fn with_reenqueue_retry_type(mut self, retry_type: ReenqueueRetryType) -> Self {
        self.reenqueue_retry_type = retry_type;
        self
    }

    /// Add a strategy parameter
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.additional_settings.get(key).map(String::as_str)
    }

    /// A required parameter
    pub fn required_setting(&self, key: &str) -> Result<&str, ConfigError> {
        self.setting(key)
            .ok_or_else(|| ConfigError::MissingSetting(key.to_string()))
    }

    /// A required ISO-8601 duration parameter
    pub fn required_duration(&self, key: &str) -> Result<Duration, ConfigError> {
        let value = self.required_setting(key)?;
        parse_iso_duration(value).map_err(|e| ConfigError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read settings from the process environment
    ///
    /// See [`QueueSettings::from_vars`] for the recognised variables.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Read settings from `{PREFIX}_*` variables
    ///
    /// - `{PREFIX}_NO_TASK_TIMEOUT_MS`, `{PREFIX}_BETWEEN_TASK_TIMEOUT_MS` (required)
    /// - `{PREFIX}_FATAL_CRASH_TIMEOUT_MS`
    /// - `{PREFIX}_PROCESSING_MODE`, `{PREFIX}_RETRY_TYPE`, `{PREFIX}_REENQUEUE_RETRY_TYPE`
    /// - `{PREFIX}_SETTING_<KEY>` for every strategy parameter
    pub fn from_vars<I>(prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        let setting_prefix = format!("{prefix}SETTING_");

        let mut own: BTreeMap<String, String> = BTreeMap::new();
        let mut additional = BTreeMap::new();
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(&setting_prefix) {
                if !key.is_empty() {
                    additional.insert(key.to_string(), value);
                }
            } else if let Some(key) = name.strip_prefix(&prefix) {
                own.insert(key.to_string(), value);
            }
        }

        let millis = |key: &str| -> Result<Option<Duration>, ConfigError> {
            own.get(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| ConfigError::InvalidEnv {
                            name: format!("{prefix}{key}"),
                            value: value.clone(),
                            reason: e.to_string(),
                        })
                })
                .transpose()
        };
        let required = |key: &str| -> Result<Duration, ConfigError> {
            millis(key)?.ok_or_else(|| ConfigError::MissingSetting(format!("{prefix}{key}")))
        };

        let mut settings = Self::new(
            required("NO_TASK_TIMEOUT_MS")?,
            required("BETWEEN_TASK_TIMEOUT_MS")?,
        );
        if let Some(timeout) = millis("FATAL_CRASH_TIMEOUT_MS")? {
            settings.fatal_crash_timeout = timeout;
        }
        if let Some(value) = own.get("PROCESSING_MODE") {
            settings.processing_mode = parse_enum(&prefix, "PROCESSING_MODE", value)?;
        }
        if let Some(value) = own.get("RETRY_TYPE") {
            settings.retry_type = parse_enum(&prefix, "RETRY_TYPE", value)?;
        }
        if let Some(value) = own.get("REENQUEUE_RETRY_TYPE") {
            settings.reenqueue_retry_type = parse_enum(&prefix, "REENQUEUE_RETRY_TYPE", value)?;
        }
        settings.additional_settings = additional;

        Ok(settings)
    }
}

fn parse_enum<T>(prefix: &str, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|reason| ConfigError::InvalidEnv {
        name: format!("{prefix}{key}"),
        value: value.to_string(),
        reason,
    })
}
