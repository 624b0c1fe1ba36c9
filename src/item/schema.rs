//! Value Schemas
//!
//! A schema decides whether a JSON value is acceptable for an item and may
//! normalize it. The store treats it as a black box: `parse(value)` either
//! returns the value to keep, or the reasons it was rejected.

use crate::error::SchemaError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// Validates (and optionally normalizes) stored values.
pub trait Schema: Send + Sync {
    /// Returns the value to keep, or why it was rejected.
    fn parse(&self, value: &Value) -> Result<Value, SchemaError>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Result<Value, SchemaError> + Send + Sync,
{
    fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        self(value)
    }
}

/// Accepts every value unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySchema;

impl Schema for AnySchema {
    fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        Ok(value.clone())
    }
}

/// Accepts values that deserialize into `T`, normalized by serializing back.
///
/// Unknown object fields are dropped unless `T` denies them, in which case
/// the value is rejected.
pub struct SerdeSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSchema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerdeSchema<{}>", std::any::type_name::<T>())
    }
}

impl<T> Schema for SerdeSchema<T>
where
    T: Serialize + DeserializeOwned,
{
    fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        let typed = T::deserialize(value).map_err(|e| SchemaError::new(e.to_string()))?;
        serde_json::to_value(&typed).map_err(|e| SchemaError::new(e.to_string()))
    }
}
