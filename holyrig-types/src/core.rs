//! Core data types.
//!
//! A rig command carries a small, closed set of parameter shapes. [`Type`]
//! describes the declared shape of a parameter or status field, [`Value`] a
//! concrete instance of one. The member-to-integer mapping of an enum lives
//! in the [`Model`](crate::model::Model), not here: the same schema enum may
//! map to different raw values on different radios.

use std::fmt::{Display, Formatter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Declared type of a command parameter or status field.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Type {
    /// Unsigned 32-bit integer.
    Int,
    /// Boolean, encoded on the wire as 1/0.
    Bool,
    /// A named enum declared in the same schema.
    Enum(String),
}

impl Type {
    /// Whether `value` inhabits this type.
    ///
    /// Enum membership is checked by name only; whether the member is
    /// *supported* is a model-level question.
    pub fn admits(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Type::Int, Value::Int(_)) | (Type::Bool, Value::Bool(_)) | (Type::Enum(_), Value::Enum(_))
        )
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Type::Int => f.write_str("int"),
            Type::Bool => f.write_str("bool"),
            Type::Enum(name) => f.write_str(name),
        }
    }
}

/// A concrete parameter or status value.
///
/// This is the tagged variant the RPC boundary coerces into; everything
/// below the dispatcher works with concrete values only.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(u32),
    /// An enum member, by schema name.
    Enum(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Enum(member) => f.write_str(member),
        }
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
