//! # Model compiler
//!
//! Compiles a rig model file against an already-compiled
//! [`Schema`](holyrig_types::Schema). Model files are TOML:
//!
//! ```text
//! [general]
//! type = "transceiver"
//! version = 1
//!
//! [enums.Vfo]
//! values = [["A", 1], ["B", 2]]
//!
//! [[init]]
//! command = "FE.FE.94.E0.19.00.FD"
//! validate = "FE.FE.E0.94.19.00.??.FD"
//!
//! [commands.set_freq]
//! command = "FE.FE.94.E0.05.??.??.??.??.FD"
//! validate = "FE.FE.E0.94.FB.FD"
//!
//! [commands.set_freq.params.freq]
//! index = 5
//! format = "bcd_lu"
//!
//! [status.freq]
//! command = "FE.FE.94.E0.03.FD"
//! validate = "FE.FE.E0.94.03.??.??.??.??.FD"
//! index = 5
//! format = "bcd_lu"
//! ```
//!
//! Frame literals are hex with optional `.` separators; `??` marks an
//! unknown byte, and `(text)` lowers an ASCII run to its bytes. A status
//! section extracts its own field from the keys written inline and may pull
//! further fields out of the same reply via `[status.<name>.fields.<other>]`.
//!
//! Validation follows the documented order: general header against the
//! schema, enum mappings, command frames, then status polls. All errors are
//! accumulated and reported with source positions where TOML provides them,
//! or with a `section.key` context path otherwise.

use std::{collections::BTreeMap, fmt::Display, fmt::Formatter, sync::Arc};

use holyrig_types::{
    frame::hole_length_at, ByteSlot, EnumMapping, FieldSpec, Format, FrameTemplate, Model,
    ReplySpec, Schema, StatusPoll, TransformOrder, ValidationError,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while_m_n},
    character::complete::char,
    combinator::{map, map_res},
    sequence::delimited,
    IResult,
};
use serde::Deserialize;
use thiserror::Error;

use crate::span::Span;

/// A model compilation error.
///
/// Carries a source span when the underlying TOML parser provides one, and
/// otherwise the `section.key` path of the offending table.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelError {
    pub span: Option<Span>,
    pub context: Option<String>,
    pub kind: ModelErrorKind,
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match (&self.span, &self.context) {
            (Some(span), _) => write!(f, "{span}: {}", self.kind),
            (None, Some(context)) => write!(f, "`{context}`: {}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl ModelError {
    fn at(context: impl Into<String>, kind: ModelErrorKind) -> Self {
        Self {
            span: None,
            context: Some(context.into()),
            kind,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ModelErrorKind {
    #[error("{0}")]
    Parse(String),
    #[error("schema kind mismatch: model says `{got}`, schema is `{expected}`")]
    KindMismatch { expected: String, got: String },
    #[error("schema version mismatch: model says {got}, schema is {expected}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("unknown transform order `{0}`; expected `add-first` or `multiply-first`")]
    UnknownTransform(String),
    #[error("enum `{0}` is not declared by the schema")]
    UnknownEnum(String),
    #[error("`{member}` is not a member of enum `{enum_name}`")]
    UnknownMember { enum_name: String, member: String },
    #[error("command `{0}` is not declared by the schema")]
    UndeclaredCommand(String),
    #[error("bad frame literal at byte {at}: {reason}")]
    BadFrameLiteral { at: usize, reason: &'static str },
    #[error("`reply_length`, `reply_end`, and `validate` are mutually exclusive")]
    ConflictingReply,
    #[error("`reply_end` must be a single fixed byte")]
    BadTerminator,
    #[error("unknown format `{0}`")]
    UnknownFormat(String),
    #[error("field length missing and index {index} does not start a hole")]
    LengthNotInferable { index: usize },
    #[error("`multiply` must not be zero")]
    ZeroMultiply,
    #[error("status section extracts nothing; give it inline field keys or a `fields` table")]
    MissingFieldSpec,
    #[error(transparent)]
    Validation(ValidationError),
}

/// Compiles model source text against `schema`.
pub fn compile(source: &str, schema: Arc<Schema>) -> Result<Model, Vec<ModelError>> {
    let file: ModelFile = toml::from_str(source).map_err(|error| {
        let span = error.span().map(|range| Span::locate(source, range.start));
        vec![ModelError {
            span,
            context: None,
            kind: ModelErrorKind::Parse(error.message().to_owned()),
        }]
    })?;

    let mut errors: Vec<ModelError> = Vec::new();

    // Rule 1: the general header must match the schema.
    if !file.general.r#type.eq_ignore_ascii_case(schema.kind()) {
        errors.push(ModelError::at(
            "general.type",
            ModelErrorKind::KindMismatch {
                expected: schema.kind().to_owned(),
                got: file.general.r#type.clone(),
            },
        ));
    }
    if file.general.version != schema.version() {
        errors.push(ModelError::at(
            "general.version",
            ModelErrorKind::VersionMismatch {
                expected: schema.version(),
                got: file.general.version,
            },
        ));
    }

    let transform = match &file.general.transform {
        None => TransformOrder::default(),
        Some(value) => TransformOrder::parse(value).unwrap_or_else(|| {
            errors.push(ModelError::at(
                "general.transform",
                ModelErrorKind::UnknownTransform(value.clone()),
            ));
            TransformOrder::default()
        }),
    };

    // Rules 2 and 3, pre-checked here so they accumulate with section
    // context; the Model constructor enforces them again.
    for (name, section) in &file.enums {
        let context = format!("enums.{name}");
        match schema.enum_type(name) {
            None => errors.push(ModelError::at(
                context,
                ModelErrorKind::UnknownEnum(name.clone()),
            )),
            Some(declared) => {
                for (member, _) in &section.values {
                    if !declared.has_member(member) {
                        errors.push(ModelError::at(
                            context.clone(),
                            ModelErrorKind::UnknownMember {
                                enum_name: name.clone(),
                                member: member.clone(),
                            },
                        ));
                    }
                }
            }
        }
    }
    for name in file.commands.keys() {
        if schema.command(name).is_none() {
            errors.push(ModelError::at(
                format!("commands.{name}"),
                ModelErrorKind::UndeclaredCommand(name.clone()),
            ));
        }
    }

    let enums: Vec<EnumMapping> = file
        .enums
        .iter()
        .map(|(name, section)| EnumMapping::new(name.clone(), section.values.clone()))
        .collect();

    let mut init = Vec::new();
    for (i, section) in file.init.iter().enumerate() {
        let context = format!("init[{i}]");
        if let Some(template) = build_frame(&context, section, &BTreeMap::new(), &mut errors) {
            init.push(template);
        }
    }

    let mut commands = Vec::new();
    for (name, section) in &file.commands {
        let context = format!("commands.{name}");
        let frame = FrameSection {
            command: section.command.clone(),
            reply_length: section.reply_length,
            reply_end: section.reply_end.clone(),
            validate: section.validate.clone(),
        };
        if let Some(template) = build_frame(&context, &frame, &section.params, &mut errors) {
            commands.push((name.clone(), template));
        }
    }

    let mut status = Vec::new();
    for (name, section) in &file.status {
        let context = format!("status.{name}");
        if let Some(poll) = build_status_poll(&context, name, section, &mut errors) {
            status.push((name.clone(), poll));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Model::new(schema, transform, enums, init, commands, status).map_err(|error| {
        vec![ModelError {
            span: None,
            context: None,
            kind: ModelErrorKind::Validation(error),
        }]
    })
}

// -------------------------------------------------------------------------
// Raw TOML shape
// -------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
    general: GeneralSection,
    #[serde(default)]
    enums: BTreeMap<String, EnumSection>,
    #[serde(default)]
    init: Vec<FrameSection>,
    #[serde(default)]
    commands: BTreeMap<String, CommandSection>,
    #[serde(default)]
    status: BTreeMap<String, StatusSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneralSection {
    r#type: String,
    version: u32,
    transform: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnumSection {
    values: Vec<(String, u32)>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameSection {
    command: String,
    reply_length: Option<usize>,
    reply_end: Option<String>,
    validate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandSection {
    command: String,
    reply_length: Option<usize>,
    reply_end: Option<String>,
    validate: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, FieldSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusSection {
    command: String,
    reply_length: Option<usize>,
    reply_end: Option<String>,
    validate: Option<String>,
    index: Option<usize>,
    length: Option<usize>,
    format: Option<String>,
    #[serde(default)]
    add: f64,
    #[serde(default = "default_multiply")]
    multiply: f64,
    #[serde(default)]
    fields: BTreeMap<String, FieldSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldSection {
    index: usize,
    length: Option<usize>,
    format: String,
    #[serde(default)]
    add: f64,
    #[serde(default = "default_multiply")]
    multiply: f64,
}

fn default_multiply() -> f64 {
    1.0
}

// -------------------------------------------------------------------------
// Frame literals
// -------------------------------------------------------------------------

fn hex_byte(input: &str) -> IResult<&str, ByteSlot> {
    alt((
        map(tag("??"), |_| ByteSlot::Unknown),
        map_res(
            take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
            |s: &str| u8::from_str_radix(s, 16).map(ByteSlot::Fixed),
        ),
    ))(input)
}

fn ascii_segment(input: &str) -> IResult<&str, Vec<ByteSlot>> {
    map(
        delimited(char('('), take_while(|c| c != ')'), char(')')),
        |s: &str| s.bytes().map(ByteSlot::Fixed).collect(),
    )(input)
}

/// Parses a frame literal: hex pairs with optional `.` separators, `??`
/// unknown bytes, and `(text)` ASCII runs.
pub(crate) fn parse_frame_literal(input: &str) -> Result<Vec<ByteSlot>, ModelErrorKind> {
    let mut slots = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            rest = tail;
            continue;
        }

        if rest.starts_with('(') {
            match ascii_segment(rest) {
                Ok((tail, mut bytes)) => {
                    slots.append(&mut bytes);
                    rest = tail;
                    continue;
                }
                Err(_) => {
                    return Err(ModelErrorKind::BadFrameLiteral {
                        at: input.len() - rest.len(),
                        reason: "unterminated ASCII segment",
                    });
                }
            }
        }

        match hex_byte(rest) {
            Ok((tail, slot)) => {
                slots.push(slot);
                rest = tail;
            }
            Err(_) => {
                return Err(ModelErrorKind::BadFrameLiteral {
                    at: input.len() - rest.len(),
                    reason: "expected two hex digits, `??`, or `(text)`",
                });
            }
        }
    }

    if slots.is_empty() {
        return Err(ModelErrorKind::BadFrameLiteral {
            at: 0,
            reason: "frame is empty",
        });
    }

    Ok(slots)
}

// -------------------------------------------------------------------------
// Section lowering
// -------------------------------------------------------------------------

fn resolve_reply(
    context: &str,
    section: &FrameSection,
    errors: &mut Vec<ModelError>,
) -> Option<ReplySpec> {
    let given = usize::from(section.reply_length.is_some())
        + usize::from(section.reply_end.is_some())
        + usize::from(section.validate.is_some());
    if given > 1 {
        errors.push(ModelError::at(context, ModelErrorKind::ConflictingReply));
        return None;
    }

    if let Some(length) = section.reply_length {
        return Some(ReplySpec::Length(length));
    }

    if let Some(end) = &section.reply_end {
        let slots = match parse_frame_literal(end) {
            Ok(slots) => slots,
            Err(kind) => {
                errors.push(ModelError::at(format!("{context}.reply_end"), kind));
                return None;
            }
        };
        return match slots.as_slice() {
            [ByteSlot::Fixed(byte)] => Some(ReplySpec::Terminator(*byte)),
            _ => {
                errors.push(ModelError::at(
                    format!("{context}.reply_end"),
                    ModelErrorKind::BadTerminator,
                ));
                None
            }
        };
    }

    if let Some(mask) = &section.validate {
        return match parse_frame_literal(mask) {
            Ok(slots) => Some(ReplySpec::Validate(slots)),
            Err(kind) => {
                errors.push(ModelError::at(format!("{context}.validate"), kind));
                None
            }
        };
    }

    Some(ReplySpec::None)
}

fn build_field_spec(
    context: &str,
    section: &FieldSection,
    infer_from: Option<&[ByteSlot]>,
    errors: &mut Vec<ModelError>,
) -> Option<FieldSpec> {
    let format = match Format::parse(&section.format) {
        Some(format) => format,
        None => {
            errors.push(ModelError::at(
                context,
                ModelErrorKind::UnknownFormat(section.format.clone()),
            ));
            return None;
        }
    };

    if section.multiply == 0.0 {
        errors.push(ModelError::at(context, ModelErrorKind::ZeroMultiply));
        return None;
    }

    let length = match section.length {
        Some(length) => length,
        None => {
            let inferred = infer_from.and_then(|pattern| hole_length_at(pattern, section.index));
            match inferred {
                Some(length) => length,
                None => {
                    errors.push(ModelError::at(
                        context,
                        ModelErrorKind::LengthNotInferable {
                            index: section.index,
                        },
                    ));
                    return None;
                }
            }
        }
    };

    Some(
        FieldSpec::new(section.index, length, format)
            .with_transform(section.add, section.multiply),
    )
}

fn build_frame(
    context: &str,
    section: &FrameSection,
    params: &BTreeMap<String, FieldSection>,
    errors: &mut Vec<ModelError>,
) -> Option<FrameTemplate> {
    let pattern = match parse_frame_literal(&section.command) {
        Ok(pattern) => pattern,
        Err(kind) => {
            errors.push(ModelError::at(format!("{context}.command"), kind));
            return None;
        }
    };

    let reply = resolve_reply(context, section, errors)?;

    let mut bindings = Vec::new();
    for (name, field) in params {
        let field_context = format!("{context}.params.{name}");
        if let Some(spec) = build_field_spec(&field_context, field, Some(&pattern), errors) {
            bindings.push((name.clone(), spec));
        }
    }

    match FrameTemplate::new(pattern, reply, bindings) {
        Ok(template) => Some(template),
        Err(error) => {
            errors.push(ModelError::at(context, ModelErrorKind::Validation(error)));
            None
        }
    }
}

fn build_status_poll(
    context: &str,
    name: &str,
    section: &StatusSection,
    errors: &mut Vec<ModelError>,
) -> Option<StatusPoll> {
    let frame = FrameSection {
        command: section.command.clone(),
        reply_length: section.reply_length,
        reply_end: section.reply_end.clone(),
        validate: section.validate.clone(),
    };
    let template = build_frame(context, &frame, &BTreeMap::new(), errors)?;

    // Field lengths are inferred from the reply mask when there is one.
    let mask: Option<Vec<ByteSlot>> = match template.reply() {
        ReplySpec::Validate(mask) => Some(mask.clone()),
        _ => None,
    };

    let mut fields = Vec::new();

    match (section.index, &section.format) {
        (Some(index), Some(format)) => {
            let inline = FieldSection {
                index,
                length: section.length,
                format: format.clone(),
                add: section.add,
                multiply: section.multiply,
            };
            if let Some(spec) = build_field_spec(context, &inline, mask.as_deref(), errors) {
                fields.push((name.to_owned(), spec));
            }
        }
        (None, None) if !section.fields.is_empty() => {}
        _ => {
            errors.push(ModelError::at(context, ModelErrorKind::MissingFieldSpec));
            return None;
        }
    }

    for (field_name, field) in &section.fields {
        let field_context = format!("{context}.fields.{field_name}");
        if let Some(spec) = build_field_spec(&field_context, field, mask.as_deref(), errors) {
            fields.push((field_name.clone(), spec));
        }
    }

    match StatusPoll::new(template, fields) {
        Ok(poll) => Some(poll),
        Err(error) => {
            errors.push(ModelError::at(context, ModelErrorKind::Validation(error)));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    const SCHEMA: &str = "\
version = 1
schema Transceiver {
    enum Vfo { Current, A, B, Unknown }
    enum Mode { LSB, USB, CW }

    fn set_freq(int freq);
    fn set_vfo(Vfo vfo);

    status {
        int freq;
        Mode mode;
        bool transmit;
    }
}
";

    const MODEL: &str = r#"
[general]
type = "transceiver"
version = 1

[enums.Vfo]
values = [["A", 1], ["B", 2]]

[enums.Mode]
values = [["LSB", 0], ["USB", 1], ["CW", 3]]

[[init]]
command = "FE.FE.94.E0.19.00.FD"
validate = "FE.FE.E0.94.19.00.??.FD"

[commands.set_freq]
command = "FE.FE.94.E0.05.??.??.??.??.FD"
validate = "FE.FE.E0.94.FB.FD"

[commands.set_freq.params.freq]
index = 5
format = "bcd_lu"

[commands.set_vfo]
command = "FE.FE.94.E0.07.??.FD"

[commands.set_vfo.params.vfo]
index = 5
length = 1
format = "int_bu"

[status.freq]
command = "FE.FE.94.E0.03.FD"
validate = "FE.FE.E0.94.03.??.??.??.??.FD"
index = 5
format = "bcd_lu"

[status.mode]
command = "FE.FE.94.E0.04.FD"
validate = "FE.FE.E0.94.04.??.??.FD"
index = 5
length = 1
format = "int_bu"

[status.mode.fields.transmit]
index = 6
length = 1
format = "int_bu"
"#;

    fn compiled() -> Model {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        compile(MODEL, schema).unwrap()
    }

    #[test]
    fn test_compile_ok() {
        let model = compiled();

        assert_eq!(1, model.init_frames().len());
        assert!(model.command("set_freq").is_some());
        assert!(model.command("set_transmit").is_none());
        assert_eq!(Some(2), model.enum_raw("Vfo", "B"));
        assert_eq!(2, model.status_polls().len());

        // Length of `freq` inferred from the 4-byte hole at index 5.
        let set_freq = model.command("set_freq").unwrap();
        let freq = set_freq.binding("freq").unwrap();
        assert_eq!(4, freq.length);
        assert_eq!(Format::BcdLu, freq.format);

        // The `mode` poll extracts a second field from the same reply.
        let (_, mode_poll) = model
            .status_polls()
            .iter()
            .find(|(n, _)| n == "mode")
            .unwrap();
        assert_eq!(2, mode_poll.fields().len());
    }

    #[test]
    fn test_frame_literals() {
        let tests: &[(&str, &[ByteSlot])] = &[
            (
                "FEFE94E0",
                &[
                    ByteSlot::Fixed(0xFE),
                    ByteSlot::Fixed(0xFE),
                    ByteSlot::Fixed(0x94),
                    ByteSlot::Fixed(0xE0),
                ],
            ),
            (
                "FE.FE",
                &[ByteSlot::Fixed(0xFE), ByteSlot::Fixed(0xFE)],
            ),
            (
                "11??22",
                &[
                    ByteSlot::Fixed(0x11),
                    ByteSlot::Unknown,
                    ByteSlot::Fixed(0x22),
                ],
            ),
            (
                "(FA;)",
                &[
                    ByteSlot::Fixed(b'F'),
                    ByteSlot::Fixed(b'A'),
                    ByteSlot::Fixed(b';'),
                ],
            ),
            (
                "(ID)0D",
                &[
                    ByteSlot::Fixed(b'I'),
                    ByteSlot::Fixed(b'D'),
                    ByteSlot::Fixed(0x0D),
                ],
            ),
        ];

        for (input, expected) in tests {
            let got = parse_frame_literal(input).unwrap();
            assert_eq!(*expected, got.as_slice(), "{input}");
        }
    }

    #[test]
    fn test_bad_frame_literals() {
        for input in ["", "F", "FE.F", "?A", "(open", "GG"] {
            assert!(parse_frame_literal(input).is_err(), "{input}");
        }
    }

    #[test]
    fn test_reply_forms_are_exclusive() {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        let source = r#"
[general]
type = "transceiver"
version = 1

[commands.set_vfo]
command = "FE.??.FD"
reply_length = 4
reply_end = "FD"

[commands.set_vfo.params.vfo]
index = 1
length = 1
format = "int_bu"
"#;
        let errors = compile(source, schema).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ModelErrorKind::ConflictingReply)));
    }

    #[test]
    fn test_general_header_checked() {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        let source = r#"
[general]
type = "receiver"
version = 3
"#;
        let errors = compile(source, schema).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ModelErrorKind::KindMismatch { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ModelErrorKind::VersionMismatch { got: 3, .. })));
    }

    #[test]
    fn test_model_cannot_invent_commands() {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        let source = r#"
[general]
type = "transceiver"
version = 1

[commands.warp_drive]
command = "FE.FD"
"#;
        let errors = compile(source, schema).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ModelErrorKind::UndeclaredCommand(_))));
    }

    #[test]
    fn test_field_over_fixed_byte_rejected() {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        let source = r#"
[general]
type = "transceiver"
version = 1

[commands.set_vfo]
command = "FE.00.FD"

[commands.set_vfo.params.vfo]
index = 1
length = 1
format = "int_bu"
"#;
        let errors = compile(source, schema).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ModelErrorKind::Validation(_))));
    }

    #[test]
    fn test_toml_error_has_span() {
        let schema = Arc::new(schema::compile(SCHEMA).unwrap());
        let errors = compile("[general\ntype = 1", schema).unwrap_err();
        assert!(matches!(errors[0].kind, ModelErrorKind::Parse(_)));
        assert!(errors[0].span.is_some());
    }
}
