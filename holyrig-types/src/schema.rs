//! Schema: the language-level description of a rig's command surface.
//!
//! A [`Schema`] declares *what* can be said to a radio — named enum types,
//! command signatures, and the status vector — without any byte-level
//! detail. The per-radio byte layouts live in a
//! [`Model`](crate::model::Model) compiled against the schema.
//!
//! All constructors validate, so a `Schema` in hand is internally
//! consistent: names are unique, every enum-typed parameter resolves to a
//! declared enum, and no enum is empty.

use crate::{
    core::Type,
    error::{ValidationError, ValidationErrorKind},
};

/// The schema version this crate understands.
pub const SCHEMA_VERSION: u32 = 1;

/// A named enum type and its ordered members.
///
/// Members carry no integer values here; the mapping is model-specific.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EnumType {
    name: String,
    members: Vec<String>,
}

impl EnumType {
    pub fn new(name: String, members: Vec<String>) -> Result<Self, ValidationError> {
        if members.is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::Empty));
        }

        if let Some(dup) = first_duplicate(members.iter()) {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: dup.to_owned(),
            }));
        }

        Ok(Self { name, members })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn has_member(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// One command parameter: a name and its declared type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
}

/// An ordered parameter list; doubles as the status vector declaration.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Signature(Vec<Parameter>);

impl Signature {
    pub fn new(parameters: Vec<Parameter>) -> Result<Self, ValidationError> {
        if let Some(dup) = first_duplicate(parameters.iter().map(|p| &p.name)) {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: dup.to_owned(),
            }));
        }

        Ok(Self(parameters))
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A compiled schema: enums, command signatures, and the status vector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Schema {
    version: u32,
    kind: String,
    enums: Vec<EnumType>,
    commands: Vec<(String, Signature)>,
    status: Signature,
}

impl Schema {
    pub fn new(
        version: u32,
        kind: String,
        enums: Vec<EnumType>,
        commands: Vec<(String, Signature)>,
        status: Signature,
    ) -> Result<Self, ValidationError> {
        if version != SCHEMA_VERSION {
            return Err(ValidationError::new(ValidationErrorKind::UnsupportedVersion {
                version,
            }));
        }

        if let Some(dup) = first_duplicate(enums.iter().map(EnumType::name)) {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: dup.to_owned(),
            }));
        }

        if let Some(dup) = first_duplicate(commands.iter().map(|(name, _)| name)) {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: dup.to_owned(),
            }));
        }

        let schema = Self {
            version,
            kind,
            enums,
            commands,
            status,
        };

        let signatures = schema
            .commands
            .iter()
            .map(|(_, sig)| sig)
            .chain(std::iter::once(&schema.status));
        for signature in signatures {
            for parameter in signature.parameters() {
                if let Type::Enum(name) = &parameter.ty {
                    if schema.enum_type(name).is_none() {
                        return Err(ValidationError::new(ValidationErrorKind::UnknownType {
                            name: name.clone(),
                        }));
                    }
                }
            }
        }

        Ok(schema)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Schema kind, e.g. `"transceiver"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn enums(&self) -> &[EnumType] {
        &self.enums
    }

    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        self.enums.iter().find(|e| e.name == name)
    }

    pub fn commands(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.commands.iter().map(|(name, sig)| (name.as_str(), sig))
    }

    pub fn command(&self, name: &str) -> Option<&Signature> {
        self.commands
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sig)| sig)
    }

    /// The declared status vector.
    pub fn status(&self) -> &Signature {
        &self.status
    }
}

fn first_duplicate<'a, I, S>(names: I) -> Option<&'a str>
where
    I: Iterator<Item = &'a S>,
    S: AsRef<str> + 'a + ?Sized,
{
    let mut seen: Vec<&str> = Vec::new();

    for name in names {
        let name = name.as_ref();
        if seen.contains(&name) {
            return Some(name);
        }
        seen.push(name);
    }

    None
}
