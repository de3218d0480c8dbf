//! Core domain types for tally
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | A named occurrence reported by the host application, frozen at enqueue time |
//! | **Property** | A key/[`Value`] pair attached to an event |
//! | **Super property** | A property registered once and merged into every later event |
//! | **Queue entry** | An event waiting for upload, with its delivery attempt counter |
//! | **Distinct id** | The identifier of the current user/device, reported with every event |

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Ordered property mapping.
pub type Properties = BTreeMap<String, Value>;

// ============================================
// Value
// ============================================

/// A property value.
///
/// Numbers are split into integer and floating representations so integers
/// keep their integer formatting on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Properties),
}

impl Value {
    /// Reject values the ingestion endpoint cannot represent.
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(Error::Validation(format!(
                "non-finite number {} is not a valid property value",
                f
            ))),
            Value::Array(items) => items.iter().try_for_each(Value::validate),
            Value::Map(map) => validate_properties(map),
            _ => Ok(()),
        }
    }

    /// Wire representation. Dates become ISO-8601 strings with millisecond precision.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => {
                serde_json::Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(properties_to_json(map)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Properties> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Validate every key and value of a property mapping.
pub fn validate_properties(props: &Properties) -> Result<()> {
    for (key, value) in props {
        if key.is_empty() {
            return Err(Error::Validation(
                "property names must not be empty".to_string(),
            ));
        }
        value.validate()?;
    }
    Ok(())
}

/// Convert a property mapping to a JSON object.
pub fn properties_to_json(props: &Properties) -> serde_json::Map<String, serde_json::Value> {
    props
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Properties> for Value {
    fn from(map: Properties) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

// ============================================
// Event
// ============================================

/// An enriched event, immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name; empty for custom-shaped events that carry no name
    pub name: String,
    /// When the application reported the event
    pub timestamp: DateTime<Utc>,
    /// Merged properties (defaults, super properties, call-site properties)
    pub properties: Properties,
    /// Extra top-level keys of a custom-shaped event
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: Properties,
}

impl Event {
    /// Wire representation: custom keys, then `event` and `properties`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = properties_to_json(&self.custom);
        if !self.name.is_empty() {
            object.insert(
                "event".to_string(),
                serde_json::Value::String(self.name.clone()),
            );
        }
        object.insert(
            "properties".to_string(),
            serde_json::Value::Object(properties_to_json(&self.properties)),
        );
        serde_json::Value::Object(object)
    }
}

// ============================================
// Queue Entry
// ============================================

/// An event waiting in the upload queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Identity of the entry within its queue; never reused
    pub id: u64,
    pub event: Event,
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}
