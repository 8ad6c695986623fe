//! Error-related types.

use std::fmt::{Display, Formatter};

use thiserror::Error;

/// A validation error.
///
/// Returned when a value would violate one of the data-model invariants,
/// e.g., a duplicate command name or a field binding that overlaps a fixed
/// byte of its frame pattern.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub struct ValidationError {
    kind: ValidationErrorKind,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Validation failed: {}", self.kind)
    }
}

#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub(crate) enum ValidationErrorKind {
    #[error("Must not be empty")]
    Empty,
    #[error("Duplicate name `{name}`")]
    Duplicate { name: String },
    #[error("Unknown type `{name}`")]
    UnknownType { name: String },
    #[error("Unknown enum `{name}`")]
    UnknownEnum { name: String },
    #[error("`{member}` is not a member of enum `{enum_name}`")]
    UnknownMember { enum_name: String, member: String },
    #[error("Unsupported schema version {version}")]
    UnsupportedVersion { version: u32 },
    #[error("Schema kind mismatch: expected `{expected}`, got `{got}`")]
    KindMismatch { expected: String, got: String },
    #[error("Command `{name}` is not declared by the schema")]
    UndeclaredCommand { name: String },
    #[error("Command `{name}` does not match its schema signature")]
    SignatureMismatch { name: String },
    #[error("Status field `{name}` is not declared by the schema")]
    UndeclaredStatusField { name: String },
    #[error("Field `{name}` lies outside the frame (index {index}, length {length}, frame {frame_len} bytes)")]
    FieldOutsideFrame {
        name: String,
        index: usize,
        length: usize,
        frame_len: usize,
    },
    #[error("Field `{name}` covers a fixed byte at index {index}")]
    FieldOverlapsFixed { name: String, index: usize },
    #[error("Field `{name}` has no length and index {index} does not start a hole")]
    LengthNotInferable { name: String, index: usize },
    #[error("Parameter `{name}` has no binding in the frame")]
    UnboundParameter { name: String },
    #[error("Binding `{name}` does not name a parameter of the command")]
    UnknownParameter { name: String },
}

impl ValidationError {
    pub(crate) fn new(kind: ValidationErrorKind) -> Self {
        Self { kind }
    }
}
