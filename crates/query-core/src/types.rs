//! Values, sort keys and predicates shared by every layer crate

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Sort direction of a single sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn is_descending(&self) -> bool {
        matches!(self, SortOrder::Desc)
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Asc
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

/// A requested sort key. Position in the surrounding sequence is significant:
/// the first entry is the primary key, the second the secondary, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortField {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Desc)
    }
}

/// Scalar value used for predicate literals, cursor positions, shard range
/// bounds and custom record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two values of compatible types. Integers and floats compare
    /// numerically; any other type mix is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Canonical byte encoding used for hash routing. Floats with an exact
    /// integer value encode like the equal `Int`.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Bool(b) => vec![u8::from(*b)],
            Value::Int(v) => v.to_be_bytes().to_vec(),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < 2f64.powi(63) => {
                (*v as i64).to_be_bytes().to_vec()
            }
            Value::Float(v) => v.to_bits().to_be_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// One side of a range predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeBound {
    pub value: Value,
    #[serde(default = "default_inclusive")]
    pub inclusive: bool,
}

fn default_inclusive() -> bool {
    true
}

impl RangeBound {
    pub fn inclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: true,
        }
    }

    pub fn exclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: false,
        }
    }
}

/// Filter applied to a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Exact equality
    Eq(Value),
    /// Membership in a literal list
    In(Vec<Value>),
    /// Bounded or half-bounded range
    Range {
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    },
    /// Case-insensitive substring match
    Contains(String),
}

impl Predicate {
    pub fn eq(value: impl Into<Value>) -> Self {
        Predicate::Eq(value.into())
    }

    pub fn between(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Predicate::Range {
            lower: Some(RangeBound::inclusive(lower)),
            upper: Some(RangeBound::inclusive(upper)),
        }
    }

    pub fn contains(text: impl Into<String>) -> Self {
        Predicate::Contains(text.into())
    }

    /// Evaluate the predicate against a concrete value.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::Eq(expected) => value.compare(expected) == Some(Ordering::Equal),
            Predicate::In(options) => options
                .iter()
                .any(|o| value.compare(o) == Some(Ordering::Equal)),
            Predicate::Range { lower, upper } => {
                let above = match lower {
                    None => true,
                    Some(b) => match value.compare(&b.value) {
                        Some(Ordering::Greater) => true,
                        Some(Ordering::Equal) => b.inclusive,
                        _ => false,
                    },
                };
                let below = match upper {
                    None => true,
                    Some(b) => match value.compare(&b.value) {
                        Some(Ordering::Less) => true,
                        Some(Ordering::Equal) => b.inclusive,
                        _ => false,
                    },
                };
                above && below
            }
            Predicate::Contains(needle) => match value {
                Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
        }
    }
}

/// Where-conditions keyed by field name. Ordered so rendering is deterministic.
pub type Conditions = BTreeMap<String, Predicate>;

/// Returns true when `name` is non-empty and made only of `[A-Za-z0-9_.]`.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
