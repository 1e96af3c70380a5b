//! Dynamic rows and their projection into typed structs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::DataError;

/// A single row keyed by column name.
///
/// Column order is not significant; rows themselves are returned in the
/// order the database produced them.
pub type Record = Map<String, Value>;

/// Projects a row into a caller-defined struct.
///
/// # Errors
///
/// Returns [`DataError::Serialization`] if the row does not match `T`.
pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, DataError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Flattens a serializable struct into a row payload.
///
/// # Errors
///
/// Returns [`DataError::Validation`] if `value` does not serialize to a
/// JSON object, or [`DataError::Serialization`] if serialization fails.
pub fn to_record<T: Serialize>(value: &T) -> Result<Record, DataError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(DataError::Validation(format!(
            "expected an object payload, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
