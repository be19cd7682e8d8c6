//! value representation
//!
//! Configuration sent to the provisioning backend and attributes returned by it share one model:
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//! - object (order-preserving "map"/"dictionary", where the key is of type string)
//!
//! There is no `null`. Backends report a missing attribute by leaving the key out, which is
//! exactly what discovery polls for.
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serializer,
};

/// All possible value types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
    Object(indexmap::IndexMap<String, Value>),
}

impl Value {
    /// Follow `path` through objects (by key) and arrays (by numeric index)
    pub fn lookup(&self, path: &FieldPath) -> Option<&Value> {
        let mut current = self;
        for segment in path.segments() {
            current = match current {
                Value::Object(object) => object.get(segment)?,
                Value::Array(array) => array.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Empty object
    pub fn object() -> Self {
        Value::Object(Default::default())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            other => match serde_json::to_string(other) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(std::fmt::Error),
            },
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Decimal(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<K: ToString, V: Into<Value>> From<indexmap::IndexMap<K, V>> for Value {
    fn from(value: indexmap::IndexMap<K, V>) -> Self {
        Value::Object(
            value
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}

impl<K: ToString, V: Into<Value>, const N: usize> From<[(K, V); N]> for Value {
    fn from(value: [(K, V); N]) -> Self {
        Value::Object(
            value
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValueError {
    #[error("null values are not supported")]
    Null,
    #[error("number {0} is out of range")]
    OutOfRange(serde_json::Number),
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as Json;

        Ok(match value {
            Json::Null => return Err(ValueError::Null),
            Json::Bool(b) => b.into(),
            Json::Number(num) => {
                if let Some(int) = num.as_i64() {
                    Value::Integer(int)
                } else if let Some(float) = num.as_f64() {
                    Value::Decimal(float)
                } else {
                    return Err(ValueError::OutOfRange(num));
                }
            }
            Json::String(s) => s.into(),
            Json::Array(array) => Value::Array(
                array
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(object) => Value::Object(
                object
                    .into_iter()
                    .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl serde::ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
        }
    }
}

/// Dotted path into a [Value], e.g. `network_interface_ids.0`
///
/// Numeric segments index into arrays, everything else is an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// The backend handle every provisioned resource exposes
    pub fn id() -> Self {
        Self(vec!["id".to_string()])
    }

    pub fn is_id(&self) -> bool {
        self.0.len() == 1 && self.0[0] == "id"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        FieldPath::parse(value)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl serde::ser::Serialize for FieldPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
