//! Column values returned by, and bound into, Spanner statements.

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// A dynamically typed column value.
///
/// The variants mirror the Spanner type system. `Date` is stored as days
/// since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL of any type
    Null,
    /// BOOL
    Bool(bool),
    /// INT64
    Int64(i64),
    /// FLOAT64
    Float64(f64),
    /// NUMERIC, kept in its exact decimal string form
    Numeric(String),
    /// STRING
    String(String),
    /// BYTES
    Bytes(Vec<u8>),
    /// DATE as days since 1970-01-01
    Date(i32),
    /// TIMESTAMP
    Timestamp(Timestamp),
    /// JSON
    Json(serde_json::Value),
    /// ARRAY of any element type
    Array(Vec<Value>),
}

impl Value {
    /// Name of the Spanner type this value carries.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOL",
            Value::Int64(_) => "INT64",
            Value::Float64(_) => "FLOAT64",
            Value::Numeric(_) => "NUMERIC",
            Value::String(_) => "STRING",
            Value::Bytes(_) => "BYTES",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the value as an i64, if it is an INT64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a string slice, if it is a STRING or NUMERIC.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a bool, if it is a BOOL.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
