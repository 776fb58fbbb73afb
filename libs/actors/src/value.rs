//! Message Values
//!
//! Messages carry an ordered tuple of tagged values. Matching works on the
//! tags (`ValueType`) and, for constants such as atoms, on exact values.

use crate::atom::Atom;
use crate::error::ExitReason;
use crate::registry::ActorId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single element of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Atom(Atom),
    Bytes(Bytes),
    Actor(ActorId),
    Reason(ExitReason),
    List(Vec<Value>),
}

/// Discriminant of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unit,
    Bool,
    I64,
    U64,
    F64,
    Str,
    Atom,
    Bytes,
    Actor,
    Reason,
    List,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Bool(_) => ValueType::Bool,
            Value::I64(_) => ValueType::I64,
            Value::U64(_) => ValueType::U64,
            Value::F64(_) => ValueType::F64,
            Value::Str(_) => ValueType::Str,
            Value::Atom(_) => ValueType::Atom,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Actor(_) => ValueType::Actor,
            Value::Reason(_) => ValueType::Reason,
            Value::List(_) => ValueType::List,
        }
    }

    pub fn as_atom(&self) -> Option<Atom> {
        match self {
            Value::Atom(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
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

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Unit => "unit",
            ValueType::Bool => "bool",
            ValueType::I64 => "i64",
            ValueType::U64 => "u64",
            ValueType::F64 => "f64",
            ValueType::Str => "str",
            ValueType::Atom => "atom",
            ValueType::Bytes => "bytes",
            ValueType::Actor => "actor",
            ValueType::Reason => "reason",
            ValueType::List => "list",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}u", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::Atom(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Actor(v) => write!(f, "{}", v),
            Value::Reason(v) => write!(f, "{}", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Typed extraction of a single message element
pub trait FromValue: Sized {
    /// Tag this type matches; `None` matches any value
    fn value_type() -> Option<ValueType>;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $variant:ident) => {
        impl FromValue for $ty {
            fn value_type() -> Option<ValueType> {
                Some(ValueType::$variant)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from_value!(bool, Bool);
impl_from_value!(i64, I64);
impl_from_value!(u64, U64);
impl_from_value!(f64, F64);
impl_from_value!(String, Str);
impl_from_value!(Atom, Atom);
impl_from_value!(Bytes, Bytes);
impl_from_value!(ActorId, Actor);
impl_from_value!(ExitReason, Reason);
impl_from_value!(Vec<Value>, List);

impl FromValue for Value {
    fn value_type() -> Option<ValueType> {
        None
    }

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for () {
    fn value_type() -> Option<ValueType> {
        Some(ValueType::Unit)
    }

    fn from_value(value: &Value) -> Option<Self> {
        matches!(value, Value::Unit).then_some(())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U64(v as u64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}
