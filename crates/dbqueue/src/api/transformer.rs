//! Payload conversion between typed values and the stored string

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::equality::DynEq;

/// Payload conversion errors
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to deserialize payload: {0}")]
    Deserialize(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(String),

    #[error("task has no payload")]
    Missing,
}

/// Converts payloads to and from their stored form
///
/// Producer and consumer of a queue must use equal transformers.
pub trait TaskPayloadTransformer<T>: DynEq + Send + Sync {
    /// Stored string to typed payload
    fn to_object(&self, payload: Option<&str>) -> Result<Option<T>, PayloadError>;

    /// Typed payload to stored string
    fn from_object(&self, payload: Option<&T>) -> Result<Option<String>, PayloadError>;
}

impl<T: 'static> PartialEq for dyn TaskPayloadTransformer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.dyn_eq(other.as_any())
    }
}

impl<T: 'static> fmt::Debug for dyn TaskPayloadTransformer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskPayloadTransformer")
    }
}

/// Stores `String` payloads as they are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoopPayloadTransformer;

impl TaskPayloadTransformer<String> for NoopPayloadTransformer {
    fn to_object(&self, payload: Option<&str>) -> Result<Option<String>, PayloadError> {
        Ok(payload.map(str::to_string))
    }

    fn from_object(&self, payload: Option<&String>) -> Result<Option<String>, PayloadError> {
        Ok(payload.cloned())
    }
}

/// Stores payloads as JSON
pub struct JsonPayloadTransformer<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonPayloadTransformer<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonPayloadTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonPayloadTransformer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

// Stateless: every instance for the same `T` is equal
impl<T> PartialEq for JsonPayloadTransformer<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> fmt::Debug for JsonPayloadTransformer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonPayloadTransformer<{}>", std::any::type_name::<T>())
    }
}

impl<T> TaskPayloadTransformer<T> for JsonPayloadTransformer<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn to_object(&self, payload: Option<&str>) -> Result<Option<T>, PayloadError> {
        payload
            .map(|text| {
                serde_json::from_str(text).map_err(|e| PayloadError::Deserialize(e.to_string()))
            })
            .transpose()
    }

    fn from_object(&self, payload: Option<&T>) -> Result<Option<String>, PayloadError> {
        payload
            .map(|value| {
                serde_json::to_string(value).map_err(|e| PayloadError::Serialize(e.to_string()))
            })
            .transpose()
    }
}
