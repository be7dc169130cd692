//! Delay for reenqueue requests that carry no explicit delay

use std::time::Duration;

use crate::api::TaskRecord;
use crate::settings::{
    parse_iso_duration, ConfigError, QueueSettings, ReenqueueRetryType, REENQUEUE_RETRY_DELAY,
    REENQUEUE_RETRY_INITIAL_DELAY, REENQUEUE_RETRY_RATIO, REENQUEUE_RETRY_SEQUENCE,
    REENQUEUE_RETRY_STEP,
};

use super::{cap_delay, RetryError, MAX_RETRY_DELAY};

/// Delay applied on `REENQUEUE` without a delay, indexed by the task's attempt count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReenqueueRetryStrategy {
    /// Consumers must always give a delay
    #[default]
    Manual,

    Fixed { delay: Duration },

    /// One delay per attempt; the last one repeats
    Sequential { delays: Vec<Duration> },

    /// `initial + (attempt - 1) * step`
    Arithmetic { initial: Duration, step: Duration },

    /// `initial * ratio^(attempt - 1)`
    Geometric { initial: Duration, ratio: u32 },
}

impl ReenqueueRetryStrategy {
    /// Strategy selected by the queue settings, with its parameters validated
    pub fn from_settings(settings: &QueueSettings) -> Result<Self, ConfigError> {
        Ok(match settings.reenqueue_retry_type {
            ReenqueueRetryType::Manual => Self::Manual,
            ReenqueueRetryType::Fixed => Self::Fixed {
                delay: settings.required_duration(REENQUEUE_RETRY_DELAY)?,
            },
            ReenqueueRetryType::Sequential => Self::Sequential {
                delays: parse_sequence(settings.required_setting(REENQUEUE_RETRY_SEQUENCE)?)?,
            },
            ReenqueueRetryType::Arithmetic => Self::Arithmetic {
                initial: settings.required_duration(REENQUEUE_RETRY_INITIAL_DELAY)?,
                step: settings.required_duration(REENQUEUE_RETRY_STEP)?,
            },
            ReenqueueRetryType::Geometric => Self::Geometric {
                initial: settings.required_duration(REENQUEUE_RETRY_INITIAL_DELAY)?,
                ratio: parse_ratio(settings.required_setting(REENQUEUE_RETRY_RATIO)?)?,
            },
        })
    }

    /// Delay for the given task
    pub fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration, RetryError> {
        let n = record.attempts_count.max(1) - 1;
        match self {
            Self::Manual => Err(RetryError::ManualReenqueueWithoutDelay { task_id: record.id }),
            Self::Fixed { delay } => Ok(cap_delay(*delay)),
            Self::Sequential { delays } => {
                let index = (n as usize).min(delays.len().saturating_sub(1));
                delays
                    .get(index)
                    .copied()
                    .map(cap_delay)
                    .ok_or(RetryError::EmptySequence)
            }
            Self::Arithmetic { initial, step } => {
                Ok(cap_delay(initial.saturating_add(step.saturating_mul(n))))
            }
            Self::Geometric { initial, ratio } => Ok(match ratio.checked_pow(n) {
                Some(factor) => cap_delay(initial.saturating_mul(factor)),
                None => MAX_RETRY_DELAY,
            }),
        }
    }
}

fn parse_sequence(value: &str) -> Result<Vec<Duration>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSetting {
        key: REENQUEUE_RETRY_SEQUENCE.to_string(),
        value: value.to_string(),
        reason,
    };

    let delays = value
        .split(',')
        .map(|item| parse_iso_duration(item.trim()).map_err(|e| invalid(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    if delays.is_empty() {
        return Err(invalid("sequence is empty".to_string()));
    }
    Ok(delays)
}

fn parse_ratio(value: &str) -> Result<u32, ConfigError> {
    match value.trim().parse::<u32>() {
        Ok(ratio) if ratio >= 1 => Ok(ratio),
        Ok(_) => Err(ConfigError::InvalidSetting {
            key: REENQUEUE_RETRY_RATIO.to_string(),
            value: value.to_string(),
            reason: "ratio must be at least 1".to_string(),
        }),
        Err(e) => Err(ConfigError::InvalidSetting {
            key: REENQUEUE_RETRY_RATIO.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const SECOND: Duration = Duration::from_secs(1);

    fn record(attempts_count: u32) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: 1,
            payload: None,
            attempts_count,
            create_date: now,
            process_time: now,
            correlation_id: None,
            actor: None,
        }
    }

    fn settings(retry_type: ReenqueueRetryType) -> QueueSettings {
        QueueSettings::new(Duration::ZERO, Duration::ZERO).with_reenqueue_retry_type(retry_type)
    }

    #[test]
    fn test_manual_requires_explicit_delay() {
        let strategy = ReenqueueRetryStrategy::from_settings(&settings(ReenqueueRetryType::Manual))
            .unwrap();

        assert!(matches!(
            strategy.calculate_delay(&record(1)),
            Err(RetryError::ManualReenqueueWithoutDelay { task_id: 1 })
        ));
    }

    #[test]
    fn test_fixed() {
        let strategy = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Fixed).with_setting(REENQUEUE_RETRY_DELAY, "PT10S"),
        )
        .unwrap();

        assert_eq!(strategy.calculate_delay(&record(1)).unwrap(), 10 * SECOND);
        assert_eq!(strategy.calculate_delay(&record(9)).unwrap(), 10 * SECOND);
    }

    #[test]
    fn test_sequential_repeats_last_delay() {
        let strategy = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Sequential)
                .with_setting(REENQUEUE_RETRY_SEQUENCE, "PT1S, PT2S,PT5S"),
        )
        .unwrap();

        let delays: Vec<_> = (1..=5)
            .map(|n| strategy.calculate_delay(&record(n)).unwrap())
            .collect();
        assert_eq!(delays, vec![SECOND, 2 * SECOND, 5 * SECOND, 5 * SECOND, 5 * SECOND]);
    }

    #[test]
    fn test_arithmetic() {
        let strategy = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Arithmetic)
                .with_setting(REENQUEUE_RETRY_INITIAL_DELAY, "PT10S")
                .with_setting(REENQUEUE_RETRY_STEP, "PT2S"),
        )
        .unwrap();

        assert_eq!(strategy.calculate_delay(&record(1)).unwrap(), 10 * SECOND);
        assert_eq!(strategy.calculate_delay(&record(4)).unwrap(), 16 * SECOND);
    }

    #[test]
    fn test_geometric() {
        let strategy = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Geometric)
                .with_setting(REENQUEUE_RETRY_INITIAL_DELAY, "PT1S")
                .with_setting(REENQUEUE_RETRY_RATIO, "3"),
        )
        .unwrap();

        assert_eq!(strategy.calculate_delay(&record(1)).unwrap(), SECOND);
        assert_eq!(strategy.calculate_delay(&record(3)).unwrap(), 9 * SECOND);
        assert_eq!(
            strategy.calculate_delay(&record(u32::MAX)).unwrap(),
            MAX_RETRY_DELAY
        );
    }

    #[test]
    fn test_invalid_parameters_are_config_errors() {
        let missing = ReenqueueRetryStrategy::from_settings(&settings(ReenqueueRetryType::Fixed));
        assert!(matches!(missing, Err(ConfigError::MissingSetting(_))));

        let bad_sequence = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Sequential)
                .with_setting(REENQUEUE_RETRY_SEQUENCE, "PT1S,,PT2S"),
        );
        assert!(matches!(bad_sequence, Err(ConfigError::InvalidSetting { .. })));

        let zero_ratio = ReenqueueRetryStrategy::from_settings(
            &settings(ReenqueueRetryType::Geometric)
                .with_setting(REENQUEUE_RETRY_INITIAL_DELAY, "PT1S")
                .with_setting(REENQUEUE_RETRY_RATIO, "0"),
        );
        assert!(matches!(zero_ratio, Err(ConfigError::InvalidSetting { .. })));
    }
}
