//! Host-side JavaScript values
//!
//! [`Value`] is what crosses the boundary between the host and a context.
//! Conversion to and from engine values happens in the bridge; this module
//! only defines the host representation.
//!
//! # Mapping
//! - `null` and `undefined` both become [`Value::Nil`]
//! - numbers become [`Value::Integer`] when they are integral and within the
//!   safe integer range, [`Value::Float`] otherwise
//! - arrays and plain objects are converted recursively
//! - script functions become [`Value::Function`] references
//! - `Error` instances become [`Value::Error`]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;

use crate::bridge::RefSlots;
use crate::error::Error;

/// Largest integer a double represents exactly (`Number.MAX_SAFE_INTEGER`)
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Handle to a script function held by a context.
///
/// A reference is only meaningful to the context that produced it; it can be
/// invoked with [`Context::call_function`](crate::Context::call_function) or
/// passed back into script as an argument. Clones share one table slot in the
/// context, which is given back once the last clone is dropped.
#[derive(Clone)]
pub struct FunctionRef {
    handle: Arc<RefHandle>,
}

struct RefHandle {
    context: u64,
    slot: u32,
    name: String,
    slots: Weak<RefSlots>,
}

impl Drop for RefHandle {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.release(self.slot);
        }
    }
}

impl FunctionRef {
    pub(crate) fn new(context: u64, slot: u32, name: String, slots: Weak<RefSlots>) -> Self {
        FunctionRef {
            handle: Arc::new(RefHandle {
                context,
                slot,
                name,
                slots,
            }),
        }
    }

    /// The function's `name` property (may be empty)
    #[inline]
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Identity of the owning context
    #[inline]
    pub fn context_id(&self) -> u64 {
        self.handle.context
    }

    #[inline]
    pub(crate) fn slot(&self) -> u32 {
        self.handle.slot
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.context_id() == other.context_id() && self.slot() == other.slot()
    }
}

impl Eq for FunctionRef {}

impl Hash for FunctionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context_id().hash(state);
        self.slot().hash(state);
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("context", &self.context_id())
            .field("slot", &self.slot())
            .field("name", &self.name())
            .finish()
    }
}

/// A value exchanged with a context
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// `null` or `undefined`
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Integral number within the safe range
    Integer(i64),
    /// Any other number
    Float(f64),
    /// String
    String(String),
    /// Array, element order preserved
    Array(Vec<Value>),
    /// Plain object, key insertion order preserved
    Object(IndexMap<String, Value>),
    /// Script function
    Function(FunctionRef),
    /// Script `Error` instance returned as a value
    Error(Box<Error>),
}

impl Value {
    /// Check if this is nil
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Get boolean value
    #[inline]
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get integer value
    #[inline]
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get integer value if it fits in an `i32`
    #[inline]
    pub fn to_i32(&self) -> Option<i32> {
        self.to_i64().and_then(|i| i32::try_from(i).ok())
    }

    /// Get any number as a float
    #[inline]
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get string contents
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get array elements
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get object properties
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(props) => Some(props),
            _ => None,
        }
    }

    /// Get function reference
    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(func) => Some(func),
            _ => None,
        }
    }

    /// Get error payload
    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Name of the variant, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
        }
    }

    /// Normalize an engine double: integral values in the safe range become
    /// integers, `-0.0` stays a float.
    pub(crate) fn from_number(n: f64) -> Value {
        let integral = n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64;
        if integral && !(n == 0.0 && n.is_sign_negative()) {
            Value::Integer(n as i64)
        } else {
            Value::Float(n)
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => {
                a.kind() == b.kind() && a.message() == b.message()
            }
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
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
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

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Nil, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(props) => {
                write!(f, "{{")?;
                for (i, (key, value)) in props.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", key, value)?;
                }
                if props.is_empty() {
                    write!(f, "}}")
                } else {
                    write!(f, " }}")
                }
            }
            Value::Function(func) if func.name().is_empty() => write!(f, "[function]"),
            Value::Function(func) => write!(f, "[function {}]", func.name()),
            Value::Error(err) => write!(f, "{}", err.message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil() {
        let v = Value::default();
        assert!(v.is_nil());
        assert_eq!(v.to_bool(), None);
        assert_eq!(Value::from(None::<i64>), Value::Nil);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(Value::from_number(2.0), Value::Integer(2));
        assert_eq!(Value::from_number(1.2), Value::Float(1.2));
        assert_eq!(
            Value::from_number(MAX_SAFE_INTEGER as f64),
            Value::Integer(MAX_SAFE_INTEGER)
        );
        assert!(matches!(Value::from_number(2f64.powi(60)), Value::Float(_)));
        assert!(matches!(Value::from_number(-0.0), Value::Float(_)));
        assert!(matches!(Value::from_number(f64::NAN), Value::Float(_)));
        assert_eq!(Value::Integer(7).to_f64(), Some(7.0));
        assert_eq!(Value::Integer(1 << 40).to_i32(), None);
    }

    #[test]
    fn test_display() {
        let mut props = IndexMap::new();
        props.insert("a".to_string(), Value::Integer(1));
        props.insert("b".to_string(), Value::Array(vec![Value::Bool(true), Value::Nil]));
        assert_eq!(Value::Object(props).to_string(), "{ a: 1, b: [true, null] }");
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
        assert_eq!(Value::Object(IndexMap::new()).to_string(), "{}");
    }
}
