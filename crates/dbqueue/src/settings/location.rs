//! Queue and shard identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Identifier of one database shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueShardId(String);

impl QueueShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a logical queue lives: the table and the queue-name discriminator
///
/// Several queues may share a table. The table name ends up inside SQL text,
/// so it must be a plain (optionally schema-qualified) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawQueueLocation")]
pub struct QueueLocation {
    table_name: String,
    queue_name: String,
}

#[derive(Deserialize)]
struct RawQueueLocation {
    table_name: String,
    queue_name: String,
}

impl TryFrom<RawQueueLocation> for QueueLocation {
    type Error = ConfigError;

    fn try_from(raw: RawQueueLocation) -> Result<Self, Self::Error> {
        Self::new(raw.table_name, raw.queue_name)
    }
}

impl QueueLocation {
    /// Create a location, validating both names
    pub fn new(
        table_name: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table_name = table_name.into();
        let queue_name = queue_name.into();

        if !is_sql_identifier(&table_name) {
            return Err(ConfigError::InvalidLocation(format!(
                "table name must be a plain SQL identifier: {table_name:?}"
            )));
        }
        if queue_name.trim().is_empty() {
            return Err(ConfigError::InvalidLocation(
                "queue name must not be blank".to_string(),
            ));
        }

        Ok(Self {
            table_name,
            queue_name,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

impl fmt::Display for QueueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.queue_name, self.table_name)
    }
}

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`
fn is_sql_identifier(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
    }
    parts <= 2
}
