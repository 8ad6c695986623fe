//! Decoding and validation of reply frames.
//!
//! A reply is first checked against its template's reply spec, then each
//! field is read, format-decoded, inverse-transformed, and coerced to its
//! declared type.

use holyrig_types::{
    FieldSpec, Format, FrameTemplate, Model, ReplySpec, StatusPoll, Type, Value,
};

use super::{invert_transform, CodecError};

/// Checks a received reply against the template's reply spec.
///
/// Unknown mask positions accept any byte; fixed positions must match.
pub fn validate_reply(template: &FrameTemplate, reply: &[u8]) -> Result<(), CodecError> {
    match template.reply() {
        ReplySpec::None => Ok(()),
        ReplySpec::Length(expected) => {
            if reply.len() == *expected {
                Ok(())
            } else {
                Err(CodecError::ReplyLengthMismatch {
                    expected: *expected,
                    got: reply.len(),
                })
            }
        }
        ReplySpec::Terminator(terminator) => {
            if reply.last() == Some(terminator) {
                Ok(())
            } else {
                Err(CodecError::MissingTerminator {
                    terminator: *terminator,
                })
            }
        }
        ReplySpec::Validate(mask) => {
            if reply.len() != mask.len() {
                return Err(CodecError::ReplyLengthMismatch {
                    expected: mask.len(),
                    got: reply.len(),
                });
            }
            for (index, (slot, byte)) in mask.iter().zip(reply).enumerate() {
                if let holyrig_types::ByteSlot::Fixed(expected) = slot {
                    if expected != byte {
                        return Err(CodecError::ReplyValidationFailed {
                            index,
                            expected: *expected,
                            got: *byte,
                        });
                    }
                }
            }
            Ok(())
        }
    }
}

/// Validates a poll reply and extracts its status fields as typed values.
pub fn decode_status(
    model: &Model,
    poll: &StatusPoll,
    reply: &[u8],
) -> Result<Vec<(String, Value)>, CodecError> {
    validate_reply(poll.template(), reply)?;

    let mut values = Vec::with_capacity(poll.fields().len());
    for (name, spec) in poll.fields() {
        let ty = model
            .schema()
            .status()
            .get(name)
            .map(|parameter| parameter.ty.clone())
            // Guarded by Model construction; treat as a decode failure.
            .ok_or_else(|| CodecError::FieldPastEnd(name.clone()))?;

        let bytes = reply
            .get(spec.index..spec.index + spec.length)
            .ok_or_else(|| CodecError::FieldPastEnd(name.clone()))?;
        let decoded = decode_field(bytes, spec)?;
        let raw = invert_transform(decoded, spec, model.transform());
        values.push((name.clone(), coerce(raw, &ty, model)?));
    }

    Ok(values)
}

/// Reads one field's bytes according to its format.
pub fn decode_field(bytes: &[u8], spec: &FieldSpec) -> Result<i128, CodecError> {
    match spec.format {
        Format::IntBu => Ok(int_from_be(bytes, false)),
        Format::IntLu => Ok(int_from_le(bytes, false)),
        Format::IntBs => Ok(int_from_be(bytes, true)),
        Format::IntLs => Ok(int_from_le(bytes, true)),
        Format::BcdBu => bcd_from_digits(bytes.iter()),
        Format::BcdLu => bcd_from_digits(bytes.iter().rev()),
        Format::BcdBs => {
            let (sign, magnitude) = bytes.split_first().ok_or(CodecError::BadSignByte(0))?;
            Ok(sign_factor(*sign)? * bcd_from_digits(magnitude.iter())?)
        }
        Format::BcdLs => {
            let (sign, magnitude) = bytes.split_last().ok_or(CodecError::BadSignByte(0))?;
            Ok(sign_factor(*sign)? * bcd_from_digits(magnitude.iter().rev())?)
        }
        Format::Text => text_from_ascii(bytes),
        Format::Yaesu => Err(CodecError::NotImplemented("yaesu")),
    }
}

/// Coerces a raw decoded integer to its declared type.
pub(crate) fn coerce(raw: i128, ty: &Type, model: &Model) -> Result<Value, CodecError> {
    match ty {
        Type::Int => u32::try_from(raw)
            .map(Value::Int)
            .map_err(|_| CodecError::ValueOutOfRange {
                value: raw,
                format: "int",
                length: 4,
            }),
        Type::Bool => Ok(Value::Bool(raw != 0)),
        Type::Enum(enum_name) => {
            let raw_u32 = u32::try_from(raw).map_err(|_| CodecError::UnknownEnumValue {
                enum_name: enum_name.clone(),
                raw,
            })?;
            model
                .enum_member(enum_name, raw_u32)
                .map(|member| Value::Enum(member.to_owned()))
                .ok_or_else(|| CodecError::UnknownEnumValue {
                    enum_name: enum_name.clone(),
                    raw,
                })
        }
    }
}

fn int_from_be(bytes: &[u8], signed: bool) -> i128 {
    let mut value: i128 = if signed && bytes.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for byte in bytes {
        value = (value << 8) | i128::from(*byte);
    }
    value
}

fn int_from_le(bytes: &[u8], signed: bool) -> i128 {
    let mut value: i128 = if signed && bytes.last().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for byte in bytes.iter().rev() {
        value = (value << 8) | i128::from(*byte);
    }
    value
}

/// Unpacks BCD bytes given most-significant-first.
fn bcd_from_digits<'a>(bytes: impl Iterator<Item = &'a u8>) -> Result<i128, CodecError> {
    let mut value: i128 = 0;
    for byte in bytes {
        let hi = byte >> 4;
        let lo = byte & 0x0F;
        if hi > 9 || lo > 9 {
            return Err(CodecError::InvalidBcd { at: *byte });
        }
        value = value * 100 + i128::from(hi) * 10 + i128::from(lo);
    }
    Ok(value)
}

fn sign_factor(byte: u8) -> Result<i128, CodecError> {
    match byte {
        0x00 => Ok(1),
        0xFF => Ok(-1),
        other => Err(CodecError::BadSignByte(other)),
    }
}

fn text_from_ascii(bytes: &[u8]) -> Result<i128, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::BadText)?;
    let trimmed = text.trim_matches(' ');
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::BadText);
    }

    let magnitude: i128 = digits.parse().map_err(|_| CodecError::BadText)?;
    Ok(if negative { -magnitude } else { magnitude })
}
