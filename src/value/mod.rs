//! # Value Type System
//!
//! Opaque values carried by tuples through the dataflow network: object
//! references from the observed graph, primitive attribute values, and `Null`
//! for positions that are unbound at a call site.
//!
//! ## Design Decisions
//!
//! - **Structural identity**: `Eq`/`Hash` are element-wise, floats compare by
//!   bit pattern so every value can live in a hash index
//! - **Cheap clones**: strings are `Arc<str>` and tuples share their column
//!   storage, since the same tuple is stored in several indexers at once
//! - **Immutable tuples**: a `Tuple` is never mutated after construction
//!
//! ## Usage
//!
//! ```
//! use patternflow::value::{ObjectId, Tuple, Value};
//!
//! let tuple = Tuple::new(vec![
//!     Value::Object(ObjectId(1)),
//!     Value::string("label"),
//!     Value::Int64(3),
//! ]);
//! assert_eq!(tuple.arity(), 3);
//! assert_eq!(tuple.project(&[2, 0]).values(), &[Value::Int64(3), Value::Object(ObjectId(1))]);
//! ```

pub mod mask;

pub use mask::Mask;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of an object (node) in the observed graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Value kinds, used to declare the expected type of a query parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int64,
    Float64,
    String,
    Object,
}

impl ValueKind {
    /// Check if a value is of this kind
    pub fn matches(&self, value: &Value) -> bool {
        value.kind() == *self
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int64 => "int64",
            ValueKind::Float64 => "float64",
            ValueKind::String => "string",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// A single column value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Unbound / absent
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(Arc<str>),
    /// Reference to an object of the observed graph
    Object(ObjectId),
}

impl Value {
    /// Get the kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int64(_) => ValueKind::Int64,
            Value::Float64(_) => ValueKind::Float64,
            Value::String(_) => ValueKind::String,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn object(id: u64) -> Self {
        Value::Object(ObjectId(id))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view, integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Object(id) => write!(f, "{id}"),
        }
    }
}

// Floats compare by bit pattern so values can key hash maps
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Object(id) => id.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            // Cross-type ordering: Null < Bool < Int64 < Float64 < String < Object
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(_), _) => Ordering::Less,
            (_, Value::Bool(_)) => Ordering::Greater,
            (Value::Int64(_), _) => Ordering::Less,
            (_, Value::Int64(_)) => Ordering::Greater,
            (Value::Float64(_), _) => Ordering::Less,
            (_, Value::Float64(_)) => Ordering::Greater,
            (Value::String(_), _) => Ordering::Less,
            (_, Value::String(_)) => Ordering::Greater,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Object(v)
    }
}

/// A fixed-arity, immutable sequence of values.
///
/// Columns are shared between clones, so storing the same tuple in several
/// indexers costs one reference count each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple {
    values: Arc<[Value]>,
}

impl Tuple {
    /// Create a new tuple from a vector of values
    pub fn new(values: Vec<Value>) -> Self {
        Tuple {
            values: Arc::from(values),
        }
    }

    /// Create an empty tuple
    pub fn empty() -> Self {
        Tuple::new(Vec::new())
    }

    /// Get the number of columns in this tuple
    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// Get a value by index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get all values as a slice
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Create a new tuple by selecting specific columns.
    ///
    /// Out-of-range indices are skipped; use [`Mask::project`] where the
    /// width contract must be enforced.
    pub fn project(&self, indices: &[usize]) -> Self {
        let values = indices
            .iter()
            .filter_map(|&i| self.values.get(i).cloned())
            .collect();
        Tuple::new(values)
    }

    /// Concatenate two tuples
    pub fn concat(&self, other: &Tuple) -> Self {
        let mut values = Vec::with_capacity(self.arity() + other.arity());
        values.extend(self.values.iter().cloned());
        values.extend(other.values.iter().cloned());
        Tuple::new(values)
    }

    /// Append a single column
    pub fn extend_with(&self, value: Value) -> Self {
        let mut values = Vec::with_capacity(self.arity() + 1);
        values.extend(self.values.iter().cloned());
        values.push(value);
        Tuple::new(values)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Self {
        Tuple::new(values)
    }
}

impl<'a> IntoIterator for &'a Tuple {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

/// Build a tuple from a list of expressions convertible into [`Value`].
#[macro_export]
macro_rules! tuple {
    ($($v:expr),* $(,)?) => {
        $crate::value::Tuple::new(vec![$($crate::value::Value::from($v)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tuple_structural_equality() {
        let a = Tuple::new(vec![Value::object(1), Value::Int64(2)]);
        let b = Tuple::new(vec![Value::object(1), Value::Int64(2)]);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_float_bitwise_identity() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
    }

    #[test]
    fn test_cross_type_ordering() {
        let mut values = vec![
            Value::object(1),
            Value::string("a"),
            Value::Int64(1),
            Value::Null,
            Value::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[4], Value::object(1));
    }

    #[test]
    fn test_concat_and_extend() {
        let a = tuple!(1i64, "x");
        let b = tuple!(true);
        assert_eq!(a.concat(&b), tuple!(1i64, "x", true));
        assert_eq!(a.extend_with(Value::Null).arity(), 3);
    }

    #[test]
    fn test_value_kind_matches() {
        assert!(ValueKind::Object.matches(&Value::object(7)));
        assert!(!ValueKind::Int64.matches(&Value::string("7")));
    }

    #[test]
    fn test_display() {
        let t = Tuple::new(vec![Value::object(3), Value::string("n"), Value::Null]);
        assert_eq!(t.to_string(), "(#3, \"n\", null)");
    }
}
