//! JavaScript values
//!
//! A value is either an immediate (numbers, booleans, `undefined`, `null`),
//! a shared immutable string, a handle to a heap object, or a boxed VM
//! marker that never escapes into user-visible state.

use std::fmt;
use std::sync::Arc;

use tern_vm_gc::{GcRef, Trace, Tracer};

/// Immutable string value
pub type JsString = Arc<str>;

/// Value-type bits, as recorded by profiling and inline caches
pub mod type_bits {
    /// `undefined`
    pub const UNDEFINED: u8 = 1 << 0;
    /// `null`
    pub const NULL: u8 = 1 << 1;
    /// Boolean
    pub const BOOLEAN: u8 = 1 << 2;
    /// 32-bit integer
    pub const INT32: u8 = 1 << 3;
    /// Double
    pub const DOUBLE: u8 = 1 << 4;
    /// String
    pub const STRING: u8 = 1 << 5;
    /// Object
    pub const OBJECT: u8 = 1 << 6;
    /// Boxed VM marker
    pub const BOXED: u8 = 1 << 7;
    /// Any number
    pub const NUMBER: u8 = INT32 | DOUBLE;
    /// `undefined` or `null`
    pub const NULL_OR_UNDEFINED: u8 = UNDEFINED | NULL;
}

/// VM markers that live in value slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boxed {
    /// The exception register holds no exception
    NoExceptionCookie,
}

/// A JavaScript value
#[derive(Clone, Default)]
pub enum Value {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// Integer in the `i32` range
    Int32(i32),
    /// Any other number, including `-0`, `NaN` and the infinities
    Double(f64),
    /// String
    String(JsString),
    /// Heap object
    Object(GcRef),
    /// Internal marker
    Boxed(Boxed),
}

impl Value {
    /// The "no exception" marker held by the exception register
    pub const NO_EXCEPTION: Value = Value::Boxed(Boxed::NoExceptionCookie);

    /// A number, stored as `Int32` when it is an integer other than `-0`
    #[inline]
    pub fn number(n: f64) -> Self {
        let i = n as i32;
        if i as f64 == n && !(i == 0 && n.is_sign_negative()) {
            Value::Int32(i)
        } else {
            Value::Double(n)
        }
    }

    /// A string value
    pub fn string(s: impl Into<JsString>) -> Self {
        Value::String(s.into())
    }

    /// Type bits of this value
    #[inline]
    pub fn type_bits(&self) -> u8 {
        match self {
            Value::Undefined => type_bits::UNDEFINED,
            Value::Null => type_bits::NULL,
            Value::Boolean(_) => type_bits::BOOLEAN,
            Value::Int32(_) => type_bits::INT32,
            Value::Double(_) => type_bits::DOUBLE,
            Value::String(_) => type_bits::STRING,
            Value::Object(_) => type_bits::OBJECT,
            Value::Boxed(_) => type_bits::BOXED,
        }
    }

    /// `undefined` check
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `undefined` or `null`
    #[inline]
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Any number
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Double(_))
    }

    /// String check
    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Object check
    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Whether this is the "no exception" marker
    #[inline]
    pub fn is_no_exception(&self) -> bool {
        matches!(self, Value::Boxed(Boxed::NoExceptionCookie))
    }

    /// Numeric value, if this is a number
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Value::Int32(i) => Some(i as f64),
            Value::Double(d) => Some(d),
            _ => None,
        }
    }

    /// Integer value, if this is a number with an exact `i32` representation
    #[inline]
    pub fn as_int32(&self) -> Option<i32> {
        match *self {
            Value::Int32(i) => Some(i),
            Value::Double(d) => {
                let i = d as i32;
                (i as f64 == d).then_some(i)
            }
            _ => None,
        }
    }

    /// Object handle
    #[inline]
    pub fn as_object(&self) -> Option<GcRef> {
        match *self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    /// String contents
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Same-value identity used by caches keyed on values.
    ///
    /// Distinguishes `-0` from `0` and treats `NaN` as equal to itself.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => {
                a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Boxed(a), Value::Boxed(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    /// Same-value comparison, so assertions can compare `NaN` and `-0`
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int32(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Object(r) => write!(f, "[object {r:?}]"),
            Value::Boxed(b) => write!(f, "<{b:?}>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<GcRef> for Value {
    fn from(r: GcRef) -> Self {
        Value::Object(r)
    }
}

impl Trace for Value {
    #[inline]
    fn trace(&self, tracer: &mut Tracer<'_>) {
        if let Value::Object(r) = *self {
            tracer.mark(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_normalization() {
        assert!(matches!(Value::number(3.0), Value::Int32(3)));
        assert!(matches!(Value::number(2147483648.0), Value::Double(d) if d == 2147483648.0));
        assert!(matches!(Value::number(-0.0), Value::Double(d) if d.is_sign_negative()));
        assert!(matches!(Value::number(0.5), Value::Double(_)));
        assert!(matches!(Value::number(f64::NAN), Value::Double(d) if d.is_nan()));
    }

    #[test]
    fn test_type_bits() {
        assert_eq!(Value::Int32(1).type_bits() & type_bits::NUMBER, type_bits::INT32);
        assert_eq!(Value::NO_EXCEPTION.type_bits(), type_bits::BOXED);
        assert!(Value::NO_EXCEPTION.is_no_exception());
        assert!(!Value::Undefined.is_no_exception());
    }

    #[test]
    fn test_same_value() {
        assert!(Value::Double(f64::NAN).same_value(&Value::Double(f64::NAN)));
        assert!(!Value::Double(-0.0).same_value(&Value::Double(0.0)));
        assert!(!Value::Int32(1).same_value(&Value::Double(1.5)));
        assert!(Value::from("a").same_value(&Value::from("a")));
    }
}
