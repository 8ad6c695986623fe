//! # Binary frame codec
//!
//! A pure function pair over (frame template, parameter binding) and byte
//! buffers. [`encode`](encode::encode_command) builds the outbound frame
//! for a command; [`decode`](decode::decode_status) checks a reply against
//! its validation mask and extracts typed status values. The codec holds no
//! state of its own: everything it needs lives in the
//! [`Model`](holyrig_types::Model), so compiled templates can be shared
//! freely between rigs and tests.

use holyrig_types::{FieldSpec, TransformOrder, Type};
use thiserror::Error;

pub mod decode;
pub mod encode;

pub use decode::{decode_status, validate_reply};
pub use encode::{encode_command, encode_frame};

/// A codec failure.
///
/// The first group is caused by the caller (bad command, parameter, or
/// value) and maps onto the invalid-parameters RPC error; the rest are
/// wire-level failures counted as communication errors.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("command `{0}` is not supported by this rig")]
    UnsupportedCommand(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    #[error("parameter `{name}` expects {expected}")]
    TypeMismatch { name: String, expected: Type },
    #[error("enum member `{enum_name}.{member}` is not supported by this rig")]
    UnsupportedEnumMember { enum_name: String, member: String },
    #[error("value {value} does not fit a {format} field of {length} bytes")]
    ValueOutOfRange {
        value: i128,
        format: &'static str,
        length: usize,
    },
    #[error("format `{0}` is not implemented")]
    NotImplemented(&'static str),

    #[error("reply byte {index} is {got:#04x}, expected {expected:#04x}")]
    ReplyValidationFailed { index: usize, expected: u8, got: u8 },
    #[error("reply is {got} bytes, expected {expected}")]
    ReplyLengthMismatch { expected: usize, got: usize },
    #[error("reply does not end with the terminator {terminator:#04x}")]
    MissingTerminator { terminator: u8 },
    #[error("field `{0}` extends past the end of the reply")]
    FieldPastEnd(String),
    #[error("no member of enum `{enum_name}` maps to {raw}")]
    UnknownEnumValue { enum_name: String, raw: i128 },
    #[error("byte {at:#04x} is not valid BCD")]
    InvalidBcd { at: u8 },
    #[error("invalid sign byte {0:#04x}")]
    BadSignByte(u8),
    #[error("field is not a decimal number")]
    BadText,
}

impl CodecError {
    /// Whether the failure is the caller's fault, as opposed to a
    /// communication problem with the radio.
    pub fn is_invalid_params(&self) -> bool {
        matches!(
            self,
            CodecError::UnsupportedCommand(_)
                | CodecError::MissingParameter(_)
                | CodecError::TypeMismatch { .. }
                | CodecError::UnsupportedEnumMember { .. }
                | CodecError::ValueOutOfRange { .. }
                | CodecError::NotImplemented(_)
        )
    }

    pub(crate) fn out_of_range(value: i128, spec: &FieldSpec) -> Self {
        CodecError::ValueOutOfRange {
            value,
            format: spec.format.as_str(),
            length: spec.length,
        }
    }
}

/// Rounds half-to-even, the rounding the numeric transform is defined with.
pub(crate) fn round_half_even(x: f64) -> i128 {
    let floor = x.floor();
    let diff = x - floor;
    let rounded = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i128) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    rounded as i128
}

/// Applies the add/multiply transform on encode.
pub(crate) fn apply_transform(value: i128, spec: &FieldSpec, order: TransformOrder) -> i128 {
    if spec.add == 0.0 && spec.multiply == 1.0 {
        return value;
    }

    match order {
        TransformOrder::AddFirst => {
            let shifted = round_half_even(value as f64 + spec.add);
            round_half_even(shifted as f64 * spec.multiply)
        }
        TransformOrder::MultiplyFirst => {
            let scaled = round_half_even(value as f64 * spec.multiply);
            round_half_even(scaled as f64 + spec.add)
        }
    }
}

/// Inverts [`apply_transform`] on decode.
pub(crate) fn invert_transform(decoded: i128, spec: &FieldSpec, order: TransformOrder) -> i128 {
    if spec.add == 0.0 && spec.multiply == 1.0 {
        return decoded;
    }

    match order {
        TransformOrder::AddFirst => round_half_even(decoded as f64 / spec.multiply - spec.add),
        TransformOrder::MultiplyFirst => {
            round_half_even((decoded as f64 - spec.add) / spec.multiply)
        }
    }
}
