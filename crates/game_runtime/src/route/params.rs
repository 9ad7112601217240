//! Helpers for pulling typed values out of request parameters.

use serde_json::{Map, Value};

use crate::error::ParamError;

/// A required, non-empty string parameter.
pub fn required_str(params: &Map<String, Value>, name: &str) -> Result<String, ParamError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(ParamError::Missing(name.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ParamError::invalid(name, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ParamError::invalid(name, "expected a string")),
    }
}

/// A required unsigned integer; numeric strings are accepted.
pub fn required_u64(params: &Map<String, Value>, name: &str) -> Result<u64, ParamError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(ParamError::Missing(name.to_string())),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| ParamError::invalid(name, "expected an unsigned integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| ParamError::invalid(name, "expected an unsigned integer")),
        Some(_) => Err(ParamError::invalid(name, "expected an unsigned integer")),
    }
}

pub fn optional_str(params: &Map<String, Value>, name: &str) -> Option<String> {
    params.get(name).and_then(Value::as_str).map(str::to_owned)
}
