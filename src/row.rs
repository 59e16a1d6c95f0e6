//! Dynamic row representation for source-of-truth query results.
//!
//! The core never assumes a fixed schema for SoT rows: [`SoTStore::execute`]
//! returns sequences of [`Row`], an insertion-ordered mapping from column
//! name to a tagged [`Value`]. This is what CacheAside serializes to JSON
//! and what the cache deserializes back on a hit.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single SoT column value. Carries just enough type information to
/// round-trip through JSON without a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// ISO-8601 string. Kept distinct from `Text` so callers that care can
    /// tell the two apart; serializes to a JSON string tagged with a
    /// `__datetime` wrapper so it round-trips unambiguously.
    DateTime(String),
    /// Base64-encoded on the wire, tagged with a `__bytes` wrapper.
    Bytes(Vec<u8>),
}

/// Internal, explicitly-tagged wire shape. Plain JSON scalars (null, bool,
/// number, string) map directly to the untagged variants; `DateTime` and
/// `Bytes` need a tag since both would otherwise collide with `Text`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Wire {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Tagged { tag: String, value: String },
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => Wire::Null.serialize(s),
            Value::Int(i) => Wire::Int(*i).serialize(s),
            Value::Float(f) => Wire::Float(*f).serialize(s),
            Value::Bool(b) => Wire::Bool(*b).serialize(s),
            Value::Text(t) => Wire::Text(t.clone()).serialize(s),
            Value::DateTime(iso) => Wire::Tagged {
                tag: "datetime".into(),
                value: iso.clone(),
            }
            .serialize(s),
            Value::Bytes(bytes) => Wire::Tagged {
                tag: "bytes".into(),
                value: STANDARD.encode(bytes),
            }
            .serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match Wire::deserialize(d)? {
            Wire::Null => Ok(Value::Null),
            Wire::Int(i) => Ok(Value::Int(i)),
            Wire::Float(f) => Ok(Value::Float(f)),
            Wire::Bool(b) => Ok(Value::Bool(b)),
            Wire::Text(t) => Ok(Value::Text(t)),
            Wire::Tagged { tag, value } => match tag.as_str() {
                "datetime" => Ok(Value::DateTime(value)),
                "bytes" => STANDARD
                    .decode(&value)
                    .map(Value::Bytes)
                    .map_err(DeError::custom),
                other => Err(DeError::custom(format!("unknown Value tag `{other}`"))),
            },
        }
    }
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::DateTime(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// An ordered collection of named columns, preserving the query's `SELECT`
/// order rather than sorting alphabetically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<(String, Value)>);

impl Row {
    pub fn new() -> Self {
        Row(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// A full result set: an ordered sequence of rows.
pub type RowSet = Vec<Row>;
