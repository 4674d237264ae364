//! Runtime value model for the document forest
//!
//! A [`Value`] is the tagged traversable variant the resolver walks:
//! plain scalars, sequences, string-keyed mappings, and lazy [`Node`]s.
//! Cloning is cheap for nodes (shared `Arc`); scalar and container
//! variants clone structurally.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::EngineError;
use crate::node::Node;

/// String-keyed mapping used throughout the engine.
pub type Map = BTreeMap<String, Value>;

/// A value in the document forest: literal, container, or lazy node.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(Map),
    Node(Arc<dyn Node>),
}

impl Value {
    /// Wrap a node for placement in a document.
    pub fn node(node: impl Node + 'static) -> Self {
        Value::Node(Arc::new(node))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Variant name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Node(_) => "node",
        }
    }

    /// Convert a plain (untagged) YAML value. Tagged values are rejected;
    /// node construction is the loader's job.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Self, EngineError> {
        match value {
            serde_yaml::Value::Null => Ok(Value::Null),
            serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_yaml::Value::Number(n) => Ok(Self::from_yaml_number(&n)),
            serde_yaml::Value::String(s) => Ok(Value::Str(s)),
            serde_yaml::Value::Sequence(items) => Ok(Value::Seq(
                items
                    .into_iter()
                    .map(Self::from_yaml)
                    .collect::<Result<_, _>>()?,
            )),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = Map::new();
                for (key, item) in mapping {
                    map.insert(yaml_key(&key)?, Self::from_yaml(item)?);
                }
                Ok(Value::Map(map))
            }
            serde_yaml::Value::Tagged(tagged) => Err(EngineError::Load(format!(
                "unexpected tag '{}' in plain value",
                tagged.tag
            ))),
        }
    }

    pub(crate) fn from_yaml_number(n: &serde_yaml::Number) -> Self {
        if let Some(i) = n.as_i64() {
            Value::Int(i)
        } else if let Some(f) = n.as_f64() {
            Value::Float(f)
        } else {
            Value::Null
        }
    }

    /// Convert a parsed JSON value. Infallible: JSON is a strict subset
    /// of the value model.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// YAML mapping keys are coerced to strings; non-scalar keys are rejected.
pub(crate) fn yaml_key(key: &serde_yaml::Value) -> Result<String, EngineError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(EngineError::Load(format!(
            "unsupported mapping key: {other:?}"
        ))),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Node(node) => write!(f, "Node({node:?})"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Node identity is pointer identity; nodes have no structural
            // equality of their own.
            (Value::Node(a), Value::Node(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Lazy nodes serialize as null; flatten the value first if the full
/// structure is wanted.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut entries = serializer.serialize_map(Some(map.len()))?;
                for (key, item) in map {
                    entries.serialize_entry(key, item)?;
                }
                entries.end()
            }
            Value::Node(_) => serializer.serialize_unit(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<V: Into<Value>> FromIterator<V> for Value {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Value::Seq(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_preserves_structure() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": [1, 2.5, "x", null, true]}"#).unwrap();
        let value = Value::from_json(json);
        let expected = Value::Map(Map::from([(
            "a".to_string(),
            Value::Seq(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Str("x".into()),
                Value::Null,
                Value::Bool(true),
            ]),
        )]));
        assert_eq!(value, expected);
    }

    #[test]
    fn from_yaml_rejects_tags() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("!property 0.a").unwrap();
        assert!(matches!(
            Value::from_yaml(yaml),
            Err(EngineError::Load(_))
        ));
    }

    #[test]
    fn yaml_number_keys_coerce_to_strings() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("1: one\ntrue: yes").unwrap();
        let value = Value::from_yaml(yaml).unwrap();
        let Value::Map(map) = value else {
            panic!("expected mapping")
        };
        assert!(map.contains_key("1"));
        assert!(map.contains_key("true"));
    }
}
