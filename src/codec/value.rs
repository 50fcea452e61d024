//! The value tree every codec transcodes.
//!
//! # Responsibilities
//! - Model null, bool, integer, float, string, array, map and tagged objects
//! - Provide cheap accessors used by the tunnel routing code
//! - Convert from `serde_json::Value` for callers that already hold JSON

use std::collections::BTreeMap;
use std::fmt;

/// String-keyed metadata that accompanies a payload.
pub type HeaderMap = BTreeMap<String, Value>;

/// A universal payload value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An object that serializes itself through a registered constructor name.
    Tagged(Tagged),
}

/// Serialized form of a registered type: constructor name plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub name: String,
    pub arguments: Vec<Value>,
}

impl Tagged {
    pub fn new(name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// The `{constructor, arguments}` map every codec writes inside its tag marker.
    pub(crate) fn to_envelope(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("constructor".to_string(), Value::String(self.name.clone()));
        map.insert("arguments".to_string(), Value::Array(self.arguments.clone()));
        Value::Map(map)
    }

    /// Inverse of [`Tagged::to_envelope`]. Returns `None` for anything else.
    pub(crate) fn from_envelope(value: Value) -> Option<Self> {
        let Value::Map(mut map) = value else {
            return None;
        };
        let name = match map.remove("constructor")? {
            Value::String(name) => name,
            _ => return None,
        };
        let arguments = match map.remove("arguments") {
            Some(Value::Array(arguments)) => arguments,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return None,
        };
        Some(Self { name, arguments })
    }
}

impl Value {
    /// An empty map, the fallback for absent or undecodable payloads.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_tagged(&self) -> Option<&Tagged> {
        match self {
            Value::Tagged(tagged) => Some(tagged),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// True for `Null` and for an empty map.
    pub fn is_empty_payload(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Map(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// Header-friendly rendering: strings print raw, everything else compactly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", key, item)?;
                }
                write!(f, "}}")
            }
            Value::Tagged(tagged) => write!(f, "{}(..)", tagged.name),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<Tagged> for Value {
    fn from(value: Tagged) -> Self {
        Value::Tagged(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, item)| (key, Value::from(item)))
                    .collect(),
            ),
        }
    }
}
