//! Encoding of outbound frames.
//!
//! The buffer starts as the template pattern with unknown slots zeroed;
//! each bound parameter is transformed, serialized per its format, and
//! spliced into place.

use std::collections::BTreeMap;

use holyrig_types::{FieldSpec, Format, FrameTemplate, Model, Type, Value};

use super::{apply_transform, CodecError};

/// Encodes a parameter-less frame, e.g. an init frame or a status poll.
pub fn encode_frame(template: &FrameTemplate) -> Vec<u8> {
    template.base_bytes()
}

/// Encodes the outbound frame for `command` with the given arguments.
///
/// Arguments are the already-coerced values for the command's schema
/// signature; extra entries are ignored, missing ones are an error.
pub fn encode_command(
    model: &Model,
    command: &str,
    args: &BTreeMap<String, Value>,
) -> Result<Vec<u8>, CodecError> {
    let template = model
        .command(command)
        .ok_or_else(|| CodecError::UnsupportedCommand(command.to_owned()))?;
    // Model ⊆ Schema, so the signature exists.
    let signature = model
        .schema()
        .command(command)
        .ok_or_else(|| CodecError::UnsupportedCommand(command.to_owned()))?;

    let mut buffer = template.base_bytes();

    for (name, spec) in template.bindings() {
        let parameter = signature
            .get(name)
            .ok_or_else(|| CodecError::MissingParameter(name.clone()))?;
        let value = args
            .get(name)
            .ok_or_else(|| CodecError::MissingParameter(name.clone()))?;

        let raw = raw_value(&parameter.ty, value, model, name)?;
        let transformed = apply_transform(raw, spec, model.transform());
        let bytes = encode_field(transformed, spec)?;
        buffer[spec.index..spec.index + spec.length].copy_from_slice(&bytes);
    }

    Ok(buffer)
}

/// The raw integer behind a typed value.
fn raw_value(
    ty: &Type,
    value: &Value,
    model: &Model,
    name: &str,
) -> Result<i128, CodecError> {
    match (ty, value) {
        (Type::Int, Value::Int(v)) => Ok(i128::from(*v)),
        (Type::Bool, Value::Bool(v)) => Ok(i128::from(*v)),
        (Type::Enum(enum_name), Value::Enum(member)) => model
            .enum_raw(enum_name, member)
            .map(i128::from)
            .ok_or_else(|| CodecError::UnsupportedEnumMember {
                enum_name: enum_name.clone(),
                member: member.clone(),
            }),
        _ => Err(CodecError::TypeMismatch {
            name: name.to_owned(),
            expected: ty.clone(),
        }),
    }
}

/// Serializes `value` into exactly `spec.length` bytes.
pub fn encode_field(value: i128, spec: &FieldSpec) -> Result<Vec<u8>, CodecError> {
    if value < 0 && !spec.format.is_signed() {
        return Err(CodecError::out_of_range(value, spec));
    }

    match spec.format {
        Format::IntBu | Format::IntLu => {
            check_unsigned_bounds(value, spec)?;
            let mut bytes = int_bytes_le(value, spec.length);
            if spec.format == Format::IntBu {
                bytes.reverse();
            }
            Ok(bytes)
        }
        Format::IntBs | Format::IntLs => {
            check_signed_bounds(value, spec)?;
            let mut bytes = int_bytes_le(value, spec.length);
            if spec.format == Format::IntBs {
                bytes.reverse();
            }
            Ok(bytes)
        }
        Format::BcdBu | Format::BcdLu => {
            let mut bytes = bcd_bytes_le(value, spec.length, spec)?;
            if spec.format == Format::BcdBu {
                bytes.reverse();
            }
            Ok(bytes)
        }
        Format::BcdBs | Format::BcdLs => {
            if spec.length == 0 {
                return Err(CodecError::out_of_range(value, spec));
            }
            let sign = if value < 0 { 0xFF } else { 0x00 };
            let mut magnitude = bcd_bytes_le(value.unsigned_abs() as i128, spec.length - 1, spec)?;
            if spec.format == Format::BcdBs {
                magnitude.reverse();
                magnitude.insert(0, sign);
            } else {
                magnitude.push(sign);
            }
            Ok(magnitude)
        }
        Format::Text => {
            let digits = value.unsigned_abs().to_string();
            let sign_len = usize::from(value < 0);
            if digits.len() + sign_len > spec.length {
                return Err(CodecError::out_of_range(value, spec));
            }
            let mut out = String::with_capacity(spec.length);
            if value < 0 {
                out.push('-');
            }
            for _ in 0..spec.length - sign_len - digits.len() {
                out.push('0');
            }
            out.push_str(&digits);
            Ok(out.into_bytes())
        }
        Format::Yaesu => Err(CodecError::NotImplemented("yaesu")),
    }
}

/// Two's-complement bytes of `value`, least significant first.
fn int_bytes_le(value: i128, length: usize) -> Vec<u8> {
    (0..length)
        .map(|i| {
            if i >= 16 {
                if value < 0 {
                    0xFF
                } else {
                    0x00
                }
            } else {
                (value >> (8 * i)) as u8
            }
        })
        .collect()
}

fn check_unsigned_bounds(value: i128, spec: &FieldSpec) -> Result<(), CodecError> {
    if spec.length < 16 {
        let max = (1i128 << (8 * spec.length as u32)) - 1;
        if value > max {
            return Err(CodecError::out_of_range(value, spec));
        }
    }
    Ok(())
}

fn check_signed_bounds(value: i128, spec: &FieldSpec) -> Result<(), CodecError> {
    if spec.length == 0 {
        return Err(CodecError::out_of_range(value, spec));
    }
    if spec.length < 16 {
        let half = 1i128 << (8 * spec.length as u32 - 1);
        if value < -half || value >= half {
            return Err(CodecError::out_of_range(value, spec));
        }
    }
    Ok(())
}

/// Packed BCD bytes of a non-negative value, least significant pair first.
fn bcd_bytes_le(value: i128, length: usize, spec: &FieldSpec) -> Result<Vec<u8>, CodecError> {
    let mut rest = value;
    let mut out = Vec::with_capacity(length);

    for _ in 0..length {
        let pair = (rest % 100) as u8;
        out.push(((pair / 10) << 4) | (pair % 10));
        rest /= 100;
    }

    if rest != 0 {
        return Err(CodecError::out_of_range(value, spec));
    }

    Ok(out)
}
