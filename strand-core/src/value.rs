//! JSON-Typed Values
//!
//! Every field on a state node holds a [`Value`]. The variants mirror the
//! JSON data model so values can flow to clients unchanged: null, booleans,
//! integers, floats, strings, ordered lists, and ordered maps.
//!
//! # Equality Policy
//!
//! Delta suppression depends on deciding whether a recomputed value is
//! "the same" as the last value a client saw. The policy here is:
//!
//! - Composite values compare structurally: lists element-wise in order,
//!   maps key-wise (insertion order does not affect equality).
//! - Floats follow IEEE-754 semantics: `NaN != NaN`, so a recomputation
//!   that produces NaN is never suppressed as unchanged, and
//!   `0.0 == -0.0`, so flipping the sign of zero is suppressed.
//! - `Int(1)` and `Float(1.0)` are *not* equal; the type tag is part of
//!   the observable value.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A JSON-typed value stored in a state node field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Structural equality with the float policy documented at module level.
    pub fn structural_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // IEEE comparison: NaN is unequal to everything, including itself.
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structural_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.structural_eq(w)))
            }
            _ => false,
        }
    }

    /// The type tag this value satisfies.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Any,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Map(_) => TypeTag::Map,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Declared type of a schema var.
///
/// `Any` admits every value; the other tags admit exactly their variant.
/// `Null` is admitted by every tag so optional fields do not need a
/// dedicated option type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Any,
}

impl TypeTag {
    /// Whether a value is acceptable for a field declared with this tag.
    pub fn admits(&self, value: &Value) -> bool {
        matches!(value, Value::Null) || *self == TypeTag::Any || value.type_tag() == *self
    }
}
