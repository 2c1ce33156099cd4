//! The metadata value union.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A metadata value.
///
/// Serializes with an adjacent tag so the type survives round-trips through
/// JSON and the WAL:
///
/// ```json
/// {"type":"string","value":"hello"}
/// {"type":"int","value":42}
/// {"type":"timestamp","value":1700000000000}
/// ```
///
/// # Comparison semantics
///
/// - [`Value::coerced_eq`] compares `Int` and `Float` numerically, so
///   `Int(4)` equals `Float(4.0)`. `Timestamp` coerces with `Int`.
/// - [`Value::compare`] orders numbers numerically, strings
///   lexicographically, and timestamps chronologically. Values of
///   non-comparable kinds return `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicit null. Present-but-null is distinct from an absent field.
    Null,
    /// Boolean true/false.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Unix epoch milliseconds.
    Timestamp(i64),
    /// Homogeneous array of values.
    Array(Vec<Value>),
}

impl Value {
    /// Returns the type name as used in the serialized tag.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
        }
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it has one.
    ///
    /// `Int`, `Float` and `Timestamp` all map onto `f64`; everything else is
    /// `None`.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) | Value::Timestamp(i) => {
                // i64 -> f64 may lose precision above 2^53; acceptable for
                // range comparison purposes.
                #[allow(clippy::cast_precision_loss)]
                Some(*i as f64)
            }
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrows the string contents, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the boolean, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrows the array elements, if this is an `Array`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Equality with numeric coercion.
    ///
    /// Numbers compare by value regardless of representation; strings and
    /// booleans compare exactly; arrays compare elementwise; `Null` equals
    /// only `Null`.
    #[must_use]
    pub fn coerced_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.coerced_eq(y))
            }
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
                _ => false,
            },
        }
    }

    /// Ordering with numeric coercion.
    ///
    /// Returns `None` when the two values are not mutually comparable
    /// (e.g. a string against a number, or anything against an array).
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Views a value as a slice of elements: arrays yield their elements,
    /// any scalar yields itself as a one-element slice.
    #[must_use]
    pub fn as_elements(&self) -> Vec<&Value> {
        match self {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Timestamp(t) => write!(f, "@{t}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
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

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
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

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion_eq() {
        assert!(Value::Int(4).coerced_eq(&Value::Float(4.0)));
        assert!(Value::Float(2.5).coerced_eq(&Value::Float(2.5)));
        assert!(!Value::Int(4).coerced_eq(&Value::Float(4.5)));
        assert!(Value::Timestamp(1000).coerced_eq(&Value::Int(1000)));
    }

    #[test]
    fn test_strings_exact() {
        assert!(Value::from("a").coerced_eq(&Value::from("a")));
        assert!(!Value::from("a").coerced_eq(&Value::from("A")));
        // No string-to-number coercion
        assert!(!Value::from("4").coerced_eq(&Value::Int(4)));
    }

    #[test]
    fn test_compare_numbers_and_strings() {
        assert_eq!(
            Value::Int(3).compare(&Value::Float(3.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::from("banana").compare(&Value::from("apple")),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_timestamp_orders_chronologically() {
        let earlier = Value::Timestamp(1_600_000_000_000);
        let later = Value::Timestamp(1_700_000_000_000);
        assert_eq!(earlier.compare(&later), Some(Ordering::Less));
    }

    #[test]
    fn test_as_elements_scalar_is_singleton() {
        let v = Value::Int(7);
        assert_eq!(v.as_elements().len(), 1);

        let arr = Value::from(vec!["a", "b"]);
        assert_eq!(arr.as_elements().len(), 2);
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = Value::Array(vec![Value::Int(1), Value::from("x"), Value::Null]);
        let json = serde_json::to_string(&v).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(v, back);
    }

    #[test]
    fn test_tag_names() {
        let json = serde_json::to_string(&Value::Timestamp(5)).expect("serialize");
        assert_eq!(json, r#"{"type":"timestamp","value":5}"#);
    }
}
