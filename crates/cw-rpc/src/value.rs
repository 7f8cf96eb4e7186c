// SPDX-License-Identifier: MIT OR Apache-2.0
//! The wire value model: everything that can cross the connection.

use std::collections::BTreeMap;

use cw_error::RpcError;

use crate::stub::Stub;

/// Re-export of the JSON number type used throughout the wire model.
///
/// `serde_json::Number` keeps the i64/u64/f64 distinction and round-trips
/// IEEE-754 doubles (including `-0.0`), which the protocol requires.
pub use serde_json::Number;

/// A value that can travel over the wire.
///
/// JSON arrays in the encoded form are always typed nodes; plain lists are
/// represented by [`Value::List`] and escaped by the codec. Capability
/// references and error markers are first-class values.
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// `true` / `false`. Never coerced to or from numbers.
    Bool(bool),
    /// A finite number. Non-finite doubles are not representable.
    Number(Number),
    /// A Unicode string. All scalar values round-trip, including U+0000.
    String(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A string-keyed map of values.
    Object(BTreeMap<String, Value>),
    /// A capability reference, local or remote.
    Cap(Stub),
    /// An error marker.
    Error(RpcError),
}

impl Value {
    /// Build a number value from a double.
    ///
    /// Fails with `InvalidValue` for NaN and infinities, which the wire
    /// format cannot represent.
    pub fn float(f: f64) -> Result<Self, RpcError> {
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| RpcError::invalid_value(format!("non-finite number {f}")))
    }

    /// `true` if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as a bool, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as an i64, if this is an integer number in range.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Borrow as an f64, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Borrow as a string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a list, if this is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as an object, if this is one.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow as a capability stub, if this is one.
    pub fn as_cap(&self) -> Option<&Stub> {
        match self {
            Value::Cap(stub) => Some(stub),
            _ => None,
        }
    }

    /// Borrow as an error marker, if this is one.
    pub fn as_error(&self) -> Option<&RpcError> {
        match self {
            Value::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            // Capabilities compare by reference identity.
            (Value::Cap(a), Value::Cap(b)) => a.same_target(b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<RpcError> for Value {
    fn from(err: RpcError) -> Self {
        Value::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_rejects_non_finite() {
        assert!(Value::float(f64::NAN).is_err());
        assert!(Value::float(f64::INFINITY).is_err());
        assert!(Value::float(f64::NEG_INFINITY).is_err());
        assert!(Value::float(1.5).is_ok());
    }

    #[test]
    fn float_preserves_negative_zero() {
        let v = Value::float(-0.0).unwrap();
        let f = v.as_f64().unwrap();
        assert_eq!(f, 0.0);
        assert!(f.is_sign_negative());
    }

    #[test]
    fn bool_and_integer_are_distinct() {
        let t = Value::from(true);
        let one = Value::from(1i64);
        assert_ne!(t, one);
        assert!(t.as_bool().is_some());
        assert!(t.as_i64().is_none());
        assert!(one.as_i64().is_some());
        assert!(one.as_bool().is_none());
    }

    #[test]
    fn accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(7i64).as_i64(), Some(7));
        let list = Value::from(vec![Value::Null, Value::from(2i64)]);
        assert_eq!(list.as_list().unwrap().len(), 2);
    }

    #[test]
    fn structural_equality() {
        let a = Value::from(vec![Value::from(1i64), Value::from("x")]);
        let b = Value::from(vec![Value::from(1i64), Value::from("x")]);
        assert_eq!(a, b);

        let mut m1 = BTreeMap::new();
        m1.insert("k".to_owned(), Value::from(true));
        let mut m2 = BTreeMap::new();
        m2.insert("k".to_owned(), Value::from(true));
        assert_eq!(Value::Object(m1), Value::Object(m2));
    }

    #[test]
    fn max_safe_integer_round_trips_through_number() {
        let max = (1i64 << 53) - 1;
        assert_eq!(Value::from(max).as_i64(), Some(9_007_199_254_740_991));
        assert_eq!(Value::from(-max).as_i64(), Some(-9_007_199_254_740_991));
    }
}
