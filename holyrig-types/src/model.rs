//! Model: a per-radio implementation of a [`Schema`].
//!
//! Where the schema says *what* can be commanded, the model says *how* a
//! particular radio spells it on the wire: raw integers for enum members,
//! init frames, a frame template per supported command, and a poll frame
//! per published status field. A model may support any subset of its
//! schema; the constructor rejects anything the schema does not declare, so
//! Model ⊆ Schema holds by construction.

use std::sync::Arc;

use crate::{
    error::{ValidationError, ValidationErrorKind},
    frame::{check_covers_unknown, ByteSlot, FieldSpec, FrameTemplate, ReplySpec},
    schema::Schema,
};

/// Order of the numeric transform applied on encode.
///
/// The default follows the documented rule (add first, then multiply); the
/// other order exists because historical rig files disagree on this point.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TransformOrder {
    #[default]
    AddFirst,
    MultiplyFirst,
}

impl TransformOrder {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "add-first" => TransformOrder::AddFirst,
            "multiply-first" => TransformOrder::MultiplyFirst,
            _ => return None,
        })
    }
}

/// Member-to-raw-integer mapping for one enum.
///
/// Members absent from the mapping are unsupported on this radio.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EnumMapping {
    name: String,
    values: Vec<(String, u32)>,
}

impl EnumMapping {
    pub fn new(name: String, values: Vec<(String, u32)>) -> Self {
        Self { name, values }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[(String, u32)] {
        &self.values
    }

    pub fn raw(&self, member: &str) -> Option<u32> {
        self.values
            .iter()
            .find(|(m, _)| m == member)
            .map(|(_, raw)| *raw)
    }

    pub fn member(&self, raw: u32) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, r)| *r == raw)
            .map(|(m, _)| m.as_str())
    }
}

/// A status poll: the frame to send plus the fields extracted from its reply.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusPoll {
    template: FrameTemplate,
    fields: Vec<(String, FieldSpec)>,
}

impl StatusPoll {
    /// Builds a poll, checking that every extraction field fits the reply.
    ///
    /// With a validation-mask reply the fields must cover unknown mask
    /// positions only; with a fixed-length reply they must fit the length;
    /// a terminator-framed reply is only checkable at runtime.
    pub fn new(
        template: FrameTemplate,
        fields: Vec<(String, FieldSpec)>,
    ) -> Result<Self, ValidationError> {
        match template.reply() {
            ReplySpec::Validate(mask) => {
                for (name, spec) in &fields {
                    check_covers_unknown(name, spec, mask)?;
                }
            }
            ReplySpec::Length(len) => {
                for (name, spec) in &fields {
                    if spec.length == 0 || spec.index + spec.length > *len {
                        return Err(ValidationError::new(
                            ValidationErrorKind::FieldOutsideFrame {
                                name: name.clone(),
                                index: spec.index,
                                length: spec.length,
                                frame_len: *len,
                            },
                        ));
                    }
                }
            }
            ReplySpec::None | ReplySpec::Terminator(_) => {}
        }

        Ok(Self { template, fields })
    }

    pub fn template(&self) -> &FrameTemplate {
        &self.template
    }

    pub fn fields(&self) -> &[(String, FieldSpec)] {
        &self.fields
    }
}

/// A compiled model, bound to its schema.
#[derive(Clone, Debug)]
pub struct Model {
    schema: Arc<Schema>,
    transform: TransformOrder,
    enums: Vec<EnumMapping>,
    init: Vec<FrameTemplate>,
    commands: Vec<(String, FrameTemplate)>,
    status: Vec<(String, StatusPoll)>,
}

impl Model {
    pub fn new(
        schema: Arc<Schema>,
        transform: TransformOrder,
        enums: Vec<EnumMapping>,
        init: Vec<FrameTemplate>,
        commands: Vec<(String, FrameTemplate)>,
        status: Vec<(String, StatusPoll)>,
    ) -> Result<Self, ValidationError> {
        for mapping in &enums {
            let declared = schema.enum_type(mapping.name()).ok_or_else(|| {
                ValidationError::new(ValidationErrorKind::UnknownEnum {
                    name: mapping.name().to_owned(),
                })
            })?;
            for (member, _) in mapping.values() {
                if !declared.has_member(member) {
                    return Err(ValidationError::new(ValidationErrorKind::UnknownMember {
                        enum_name: mapping.name().to_owned(),
                        member: member.clone(),
                    }));
                }
            }
        }

        for (name, template) in &commands {
            let signature = schema.command(name).ok_or_else(|| {
                ValidationError::new(ValidationErrorKind::UndeclaredCommand { name: name.clone() })
            })?;

            for (bound, _) in template.bindings() {
                if signature.get(bound).is_none() {
                    return Err(ValidationError::new(ValidationErrorKind::UnknownParameter {
                        name: format!("{name}.{bound}"),
                    }));
                }
            }
            for parameter in signature.parameters() {
                if template.binding(&parameter.name).is_none() {
                    return Err(ValidationError::new(ValidationErrorKind::UnboundParameter {
                        name: format!("{name}.{}", parameter.name),
                    }));
                }
            }
        }

        for (name, poll) in &status {
            if schema.status().get(name).is_none() {
                return Err(ValidationError::new(
                    ValidationErrorKind::UndeclaredStatusField { name: name.clone() },
                ));
            }
            for (field, _) in poll.fields() {
                if schema.status().get(field).is_none() {
                    return Err(ValidationError::new(
                        ValidationErrorKind::UndeclaredStatusField {
                            name: field.clone(),
                        },
                    ));
                }
            }
        }

        Ok(Self {
            schema,
            transform,
            enums,
            init,
            commands,
            status,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn transform(&self) -> TransformOrder {
        self.transform
    }

    pub fn init_frames(&self) -> &[FrameTemplate] {
        &self.init
    }

    pub fn commands(&self) -> impl Iterator<Item = (&str, &FrameTemplate)> {
        self.commands.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn command(&self, name: &str) -> Option<&FrameTemplate> {
        self.commands
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn status_polls(&self) -> &[(String, StatusPoll)] {
        &self.status
    }

    /// Raw wire value of an enum member, when this radio supports it.
    pub fn enum_raw(&self, enum_name: &str, member: &str) -> Option<u32> {
        self.enums
            .iter()
            .find(|m| m.name() == enum_name)
            .and_then(|m| m.raw(member))
    }

    /// Member whose mapped value equals `raw`.
    pub fn enum_member(&self, enum_name: &str, raw: u32) -> Option<&str> {
        self.enums
            .iter()
            .find(|m| m.name() == enum_name)
            .and_then(|m| m.member(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Type,
        schema::{EnumType, Parameter, Signature, SCHEMA_VERSION},
    };

    fn schema() -> Arc<Schema> {
        let vfo = EnumType::new(
            "Vfo".into(),
            vec!["Current".into(), "A".into(), "B".into(), "Unknown".into()],
        )
        .unwrap();
        let set_vfo = Signature::new(vec![Parameter {
            name: "vfo".into(),
            ty: Type::Enum("Vfo".into()),
        }])
        .unwrap();
        let status = Signature::new(vec![Parameter {
            name: "freq".into(),
            ty: Type::Int,
        }])
        .unwrap();

        Arc::new(
            Schema::new(
                SCHEMA_VERSION,
                "transceiver".into(),
                vec![vfo],
                vec![("set_vfo".into(), set_vfo)],
                status,
            )
            .unwrap(),
        )
    }

    fn set_vfo_template() -> FrameTemplate {
        FrameTemplate::new(
            vec![ByteSlot::Fixed(0x07), ByteSlot::Unknown],
            ReplySpec::None,
            vec![("vfo".into(), FieldSpec::new(1, 1, crate::frame::Format::IntBu))],
        )
        .unwrap()
    }

    #[test]
    fn test_model_subset_of_schema() {
        let mapping = EnumMapping::new("Vfo".into(), vec![("A".into(), 1), ("B".into(), 2)]);

        let model = Model::new(
            schema(),
            TransformOrder::default(),
            vec![mapping],
            vec![],
            vec![("set_vfo".into(), set_vfo_template())],
            vec![],
        )
        .unwrap();

        assert_eq!(Some(2), model.enum_raw("Vfo", "B"));
        assert_eq!(None, model.enum_raw("Vfo", "Current"));
        assert_eq!(Some("B"), model.enum_member("Vfo", 2));
        assert_eq!(None, model.enum_member("Vfo", 7));
    }

    #[test]
    fn test_unknown_member_rejected() {
        let mapping = EnumMapping::new("Vfo".into(), vec![("C".into(), 3)]);
        let result = Model::new(
            schema(),
            TransformOrder::default(),
            vec![mapping],
            vec![],
            vec![],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_undeclared_command_rejected() {
        let result = Model::new(
            schema(),
            TransformOrder::default(),
            vec![],
            vec![],
            vec![("set_freq".into(), set_vfo_template())],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unbound_parameter_rejected() {
        let template =
            FrameTemplate::new(vec![ByteSlot::Fixed(0x07)], ReplySpec::None, vec![]).unwrap();
        let result = Model::new(
            schema(),
            TransformOrder::default(),
            vec![],
            vec![],
            vec![("set_vfo".into(), template)],
            vec![],
        );
        assert!(result.is_err());
    }
}
