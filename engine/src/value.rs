//! Pre-wire attribute values.
//!
//! Application models hand over richer values than JSON can carry: time
//! values and non-finite floats exist here and are stripped by the
//! serialization [`filter`](crate::filter) before anything reaches the bus.
//! Map keys may be non-text; the filter normalizes them.

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::borrow::Cow;

/// A map key as produced by application code.
#[derive(Debug, Clone, PartialEq)]
pub enum RawKey {
    Text(String),
    Int(i64),
}

impl RawKey {
    /// Text form of the key; integer keys borrow nothing.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            RawKey::Text(s) => Cow::Borrowed(s),
            RawKey::Int(i) => Cow::Owned(i.to_string()),
        }
    }
}

impl From<&str> for RawKey {
    fn from(s: &str) -> Self {
        RawKey::Text(s.to_string())
    }
}

impl From<String> for RawKey {
    fn from(s: String) -> Self {
        RawKey::Text(s)
    }
}

impl From<i64> for RawKey {
    fn from(i: i64) -> Self {
        RawKey::Int(i)
    }
}

/// A raw attribute value before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Unsupported on the wire; dropped by the filter
    Time(DateTime<Utc>),
    List(Vec<RawValue>),
    Map(Vec<(RawKey, RawValue)>),
}

impl RawValue {
    /// Total JSON rendering, used where a value must survive regardless of
    /// wire safety: times become RFC 3339 strings, non-finite floats null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawValue::Null => serde_json::Value::Null,
            RawValue::Bool(b) => serde_json::Value::Bool(*b),
            RawValue::Int(i) => serde_json::Value::from(*i),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RawValue::Text(s) => serde_json::Value::String(s.clone()),
            RawValue::Time(t) => serde_json::Value::String(t.to_rfc3339()),
            RawValue::List(items) => {
                serde_json::Value::Array(items.iter().map(RawValue::to_json).collect())
            }
            RawValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.as_text().into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl Serialize for RawValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawValue::Null => serializer.serialize_unit(),
            RawValue::Bool(b) => serializer.serialize_bool(*b),
            RawValue::Int(i) => serializer.serialize_i64(*i),
            RawValue::Float(f) => serializer.serialize_f64(*f),
            RawValue::Text(s) => serializer.serialize_str(s),
            RawValue::Time(t) => serializer.serialize_str(&t.to_rfc3339()),
            RawValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            RawValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key.as_text().as_ref(), value)?;
                }
                map.end()
            }
        }
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Int(i)
    }
}

impl From<f64> for RawValue {
    fn from(f: f64) -> Self {
        RawValue::Float(f)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(t: DateTime<Utc>) -> Self {
        RawValue::Time(t)
    }
}

impl From<&serde_json::Value> for RawValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(RawValue::Int)
                .unwrap_or_else(|| RawValue::Float(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                RawValue::List(items.iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(entries) => RawValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (RawKey::Text(k.clone()), RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Convert a storage row into a raw attribute row.
pub fn raw_row(attributes: &crate::Attributes) -> crate::RawRow {
    attributes
        .iter()
        .map(|(field, value)| (field.clone(), RawValue::from(value)))
        .collect()
}
