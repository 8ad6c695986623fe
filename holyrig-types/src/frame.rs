//! Frame templates: the byte-level shape of one request or reply.
//!
//! A [`FrameTemplate`] is a pattern of fixed and unknown bytes, a
//! [`ReplySpec`] describing how the matching reply is framed, and bindings
//! from parameter names to [`FieldSpec`]s. A *hole* is a run of consecutive
//! unknown bytes; every field binding must cover unknown bytes only, which
//! the constructor enforces.

use crate::error::{ValidationError, ValidationErrorKind};

/// One byte position of a frame pattern.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ByteSlot {
    /// A literal byte.
    Fixed(u8),
    /// Filled by a field on encode; accepts any byte on match.
    Unknown,
}

/// How the reply to a frame is delimited and checked.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ReplySpec {
    /// No reply is expected; the exchange is write-only.
    None,
    /// Exactly this many bytes.
    Length(usize),
    /// Read until this byte is seen (inclusive).
    Terminator(u8),
    /// Byte-for-byte validation mask; implies the reply length.
    Validate(Vec<ByteSlot>),
}

impl ReplySpec {
    /// The reply length, when the spec fixes one.
    pub fn known_length(&self) -> Option<usize> {
        match self {
            ReplySpec::Length(len) => Some(*len),
            ReplySpec::Validate(mask) => Some(mask.len()),
            ReplySpec::None | ReplySpec::Terminator(_) => None,
        }
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, ReplySpec::None)
    }
}

/// Binary serialization format of a field.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    /// ASCII decimal digits, zero-padded, `-` prefix when negative.
    Text,
    /// Unsigned big-endian integer.
    IntBu,
    /// Unsigned little-endian integer.
    IntLu,
    /// Signed big-endian integer, two's complement.
    IntBs,
    /// Signed little-endian integer, two's complement.
    IntLs,
    /// Unsigned big-endian BCD, two digits per byte.
    BcdBu,
    /// Unsigned little-endian BCD.
    BcdLu,
    /// Signed big-endian BCD; leading 0x00/0xFF sign byte.
    BcdBs,
    /// Signed little-endian BCD; trailing 0x00/0xFF sign byte.
    BcdLs,
    /// Reserved for Yaesu-specific packing.
    Yaesu,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => Format::Text,
            "int_bu" => Format::IntBu,
            "int_lu" => Format::IntLu,
            "int_bs" => Format::IntBs,
            "int_ls" => Format::IntLs,
            "bcd_bu" => Format::BcdBu,
            "bcd_lu" => Format::BcdLu,
            "bcd_bs" => Format::BcdBs,
            "bcd_ls" => Format::BcdLs,
            "yaesu" => Format::Yaesu,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Text => "text",
            Format::IntBu => "int_bu",
            Format::IntLu => "int_lu",
            Format::IntBs => "int_bs",
            Format::IntLs => "int_ls",
            Format::BcdBu => "bcd_bu",
            Format::BcdLu => "bcd_lu",
            Format::BcdBs => "bcd_bs",
            Format::BcdLs => "bcd_ls",
            Format::Yaesu => "yaesu",
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Format::IntBs | Format::IntLs | Format::BcdBs | Format::BcdLs | Format::Text
        )
    }
}

/// Placement and representation of one value inside a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    /// 0-based byte offset into the frame.
    pub index: usize,
    /// Field width in bytes.
    pub length: usize,
    pub format: Format,
    /// Added to the value before `multiply` on encode (default 0).
    pub add: f64,
    /// Scale applied after `add` on encode (default 1).
    pub multiply: f64,
}

impl FieldSpec {
    pub fn new(index: usize, length: usize, format: Format) -> Self {
        Self {
            index,
            length,
            format,
            add: 0.0,
            multiply: 1.0,
        }
    }

    pub fn with_transform(mut self, add: f64, multiply: f64) -> Self {
        self.add = add;
        self.multiply = multiply;
        self
    }
}

/// A request (or poll) frame: pattern, reply framing, and field bindings.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameTemplate {
    pattern: Vec<ByteSlot>,
    reply: ReplySpec,
    bindings: Vec<(String, FieldSpec)>,
}

impl FrameTemplate {
    pub fn new(
        pattern: Vec<ByteSlot>,
        reply: ReplySpec,
        bindings: Vec<(String, FieldSpec)>,
    ) -> Result<Self, ValidationError> {
        if pattern.is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::Empty));
        }

        if let Some((dup, _)) = bindings
            .iter()
            .enumerate()
            .find_map(|(i, (name, _))| bindings[..i].iter().find(|(n, _)| n == name))
        {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: dup.clone(),
            }));
        }

        for (name, spec) in &bindings {
            check_covers_unknown(name, spec, &pattern)?;
        }

        Ok(Self {
            pattern,
            reply,
            bindings,
        })
    }

    pub fn pattern(&self) -> &[ByteSlot] {
        &self.pattern
    }

    pub fn reply(&self) -> &ReplySpec {
        &self.reply
    }

    pub fn bindings(&self) -> &[(String, FieldSpec)] {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&FieldSpec> {
        self.bindings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    /// The pattern with every unknown slot zeroed; the encoder's canvas.
    pub fn base_bytes(&self) -> Vec<u8> {
        self.pattern
            .iter()
            .map(|slot| match slot {
                ByteSlot::Fixed(byte) => *byte,
                ByteSlot::Unknown => 0x00,
            })
            .collect()
    }
}

/// Length of the hole starting exactly at `index`, if one starts there.
///
/// Used by the model compiler to infer an omitted field length.
pub fn hole_length_at(pattern: &[ByteSlot], index: usize) -> Option<usize> {
    let starts_hole = matches!(pattern.get(index), Some(ByteSlot::Unknown))
        && (index == 0 || matches!(pattern[index - 1], ByteSlot::Fixed(_)));
    if !starts_hole {
        return None;
    }

    Some(
        pattern[index..]
            .iter()
            .take_while(|slot| matches!(slot, ByteSlot::Unknown))
            .count(),
    )
}

pub(crate) fn check_covers_unknown(
    name: &str,
    spec: &FieldSpec,
    pattern: &[ByteSlot],
) -> Result<(), ValidationError> {
    let end = spec.index.checked_add(spec.length);
    match end {
        Some(end) if spec.length > 0 && end <= pattern.len() => {}
        _ => {
            return Err(ValidationError::new(ValidationErrorKind::FieldOutsideFrame {
                name: name.to_owned(),
                index: spec.index,
                length: spec.length,
                frame_len: pattern.len(),
            }))
        }
    }

    for (offset, slot) in pattern[spec.index..spec.index + spec.length].iter().enumerate() {
        if let ByteSlot::Fixed(_) = slot {
            return Err(ValidationError::new(ValidationErrorKind::FieldOverlapsFixed {
                name: name.to_owned(),
                index: spec.index + offset,
            }));
        }
    }

    Ok(())
}
