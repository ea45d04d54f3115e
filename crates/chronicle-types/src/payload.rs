//! The payload value model.
//!
//! Envelope payloads are string-keyed maps of scalars and nested maps. The
//! model is deliberately narrower than general-purpose JSON: signed and
//! unsigned integers are distinct domains (widened to 64 bit), both float
//! widths collapse into `f64`, and there are no arrays or nulls. The
//! registry's codec is the only component that converts between this model
//! and user payload aggregates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A string-keyed payload map, ordered for deterministic encoding.
pub type PayloadMap = BTreeMap<String, PayloadValue>;

/// One payload field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PayloadValue {
    /// UTF-8 string, stored as-is.
    String(String),
    /// Boolean, stored as-is.
    Bool(bool),
    /// Signed integer, widened to 64 bit.
    Int(i64),
    /// Unsigned integer, widened to 64 bit.
    UInt(u64),
    /// Floating point number; both 32 and 64 bit fields widen to this.
    Float(f64),
    /// Nested map, either a free-form map field or a nested aggregate.
    Map(PayloadMap),
}

/// The kind of a [`PayloadValue`], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A [`PayloadValue::String`].
    String,
    /// A [`PayloadValue::Bool`].
    Bool,
    /// A [`PayloadValue::Int`].
    Int,
    /// A [`PayloadValue::UInt`].
    UInt,
    /// A [`PayloadValue::Float`].
    Float,
    /// A [`PayloadValue::Map`].
    Map,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PayloadKind::String => "string",
            PayloadKind::Bool => "bool",
            PayloadKind::Int => "signed integer",
            PayloadKind::UInt => "unsigned integer",
            PayloadKind::Float => "float",
            PayloadKind::Map => "map",
        };
        f.write_str(name)
    }
}

impl PayloadValue {
    /// The kind of this value.
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadValue::String(_) => PayloadKind::String,
            PayloadValue::Bool(_) => PayloadKind::Bool,
            PayloadValue::Int(_) => PayloadKind::Int,
            PayloadValue::UInt(_) => PayloadKind::UInt,
            PayloadValue::Float(_) => PayloadKind::Float,
            PayloadValue::Map(_) => PayloadKind::Map,
        }
    }

    /// Borrow as a string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a bool, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read as a signed integer. Unsigned values do not coerce.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Read as an unsigned integer. Signed values do not coerce.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PayloadValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Read as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow as a nested map, if this is one.
    pub fn as_map(&self) -> Option<&PayloadMap> {
        match self {
            PayloadValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::String(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::String(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Int(value)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Int(value.into())
    }
}

impl From<u64> for PayloadValue {
    fn from(value: u64) -> Self {
        PayloadValue::UInt(value)
    }
}

impl From<u32> for PayloadValue {
    fn from(value: u32) -> Self {
        PayloadValue::UInt(value.into())
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Float(value)
    }
}

impl From<f32> for PayloadValue {
    fn from(value: f32) -> Self {
        PayloadValue::Float(value.into())
    }
}

impl From<PayloadMap> for PayloadValue {
    fn from(value: PayloadMap) -> Self {
        PayloadValue::Map(value)
    }
}
