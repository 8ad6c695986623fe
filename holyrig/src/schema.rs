//! # Schema compiler
//!
//! Parses the declarative schema syntax into a
//! [`Schema`](holyrig_types::Schema):
//!
//! ```text
//! version = 1
//!
//! schema Transceiver {
//!     enum Vfo { Current, A, B, Unknown }
//!
//!     fn set_freq(int freq);
//!     fn set_vfo(Vfo vfo);
//!
//!     status {
//!         int freq;
//!         Vfo vfo;
//!         bool transmit;
//!     }
//! }
//! ```
//!
//! The surface is whitespace-insensitive, tolerates trailing commas, and
//! accepts `#` line comments. Type names resolve case-insensitively;
//! `int` and `bool` are reserved, anything else must name an enum declared
//! in the same block.
//!
//! Structural errors (bad token, missing brace or semicolon) abort parsing
//! at the first offense so the reported span is precise; semantic errors
//! (duplicates, unknown types, empty enums, wrong version) are accumulated
//! across the whole block.

use std::fmt::{Display, Formatter};

use holyrig_types::{
    schema::{EnumType, Parameter, Signature, SCHEMA_VERSION},
    Schema, Type, ValidationError,
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::{char, multispace1},
    combinator::recognize,
    multi::many0_count,
    sequence::pair,
    IResult,
};
use thiserror::Error;

use crate::span::Span;

/// A schema compilation error, located in the source.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{span}: {kind}")]
pub struct SchemaError {
    pub span: Span,
    pub kind: SchemaErrorKind,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SchemaErrorKind {
    #[error("unrecognized character `{found}`")]
    UnrecognizedChar { found: char },
    #[error("number is too large")]
    NumberTooLarge,
    #[error("expected {expected}, found `{found}`")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String },
    #[error("unsupported schema version {version}")]
    UnsupportedVersion { version: u64 },
    #[error("duplicate name `{name}`")]
    Duplicate { name: String },
    #[error("unknown type `{name}`; expected int, bool, or a declared enum")]
    UnknownType { name: String },
    #[error("enum `{name}` has no members")]
    EmptyEnum { name: String },
    #[error(transparent)]
    Validation(ValidationError),
}

/// Compiles schema source text.
///
/// On failure every accumulated error is returned; the list is never empty.
pub fn compile(source: &str) -> Result<Schema, Vec<SchemaError>> {
    let tokens = lex(source).map_err(|error| vec![error])?;
    let ast = parse(source, &tokens).map_err(|error| vec![error])?;
    lower(source, ast)
}

// -------------------------------------------------------------------------
// Lexer
// -------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TokenKind<'a> {
    Ident(&'a str),
    Number(u64),
    Punct(char),
}

impl Display for TokenKind<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            TokenKind::Ident(name) => f.write_str(name),
            TokenKind::Number(value) => write!(f, "{value}"),
            TokenKind::Punct(c) => write!(f, "{c}"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Token<'a> {
    kind: TokenKind<'a>,
    offset: usize,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        many0_count(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_digit())(input)
}

fn trivia(input: &str) -> IResult<&str, &str> {
    recognize(many0_count(alt((
        multispace1,
        recognize(pair(char('#'), nom::combinator::opt(is_not("\n")))),
    ))))(input)
}

fn lex(source: &str) -> Result<Vec<Token>, SchemaError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    loop {
        // Trivia never fails; it consumes zero or more bytes.
        rest = trivia(rest).map(|(rest, _)| rest).unwrap_or(rest);
        if rest.is_empty() {
            break;
        }

        let offset = source.len() - rest.len();

        if let Ok((tail, name)) = identifier(rest) {
            tokens.push(Token {
                kind: TokenKind::Ident(name),
                offset,
            });
            rest = tail;
            continue;
        }

        if let Ok((tail, digits)) = number(rest) {
            let value = digits.parse::<u64>().map_err(|_| SchemaError {
                span: Span::locate(source, offset),
                kind: SchemaErrorKind::NumberTooLarge,
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                offset,
            });
            rest = tail;
            continue;
        }

        let c = rest.chars().next().unwrap_or_default();
        if matches!(c, '{' | '}' | '(' | ')' | ',' | ';' | '=') {
            tokens.push(Token {
                kind: TokenKind::Punct(c),
                offset,
            });
            rest = &rest[c.len_utf8()..];
            continue;
        }

        return Err(SchemaError {
            span: Span::locate(source, offset),
            kind: SchemaErrorKind::UnrecognizedChar { found: c },
        });
    }

    Ok(tokens)
}

// -------------------------------------------------------------------------
// Parser (structural; aborts on first error)
// -------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Spanned<T> {
    value: T,
    offset: usize,
}

#[derive(Clone, Debug)]
struct EnumDecl {
    name: Spanned<String>,
    members: Vec<Spanned<String>>,
}

#[derive(Clone, Debug)]
struct FnDecl {
    name: Spanned<String>,
    /// (type, parameter name) in declaration order.
    params: Vec<(Spanned<String>, Spanned<String>)>,
}

#[derive(Clone, Debug)]
struct SchemaAst {
    version: Spanned<u64>,
    name: Spanned<String>,
    enums: Vec<EnumDecl>,
    fns: Vec<FnDecl>,
    status: Vec<(Spanned<String>, Spanned<String>)>,
}

struct TokenStream<'a> {
    source: &'a str,
    tokens: &'a [Token<'a>],
    pos: usize,
}

impl<'a> TokenStream<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &str) -> Result<Token<'a>, SchemaError> {
        let token = self.tokens.get(self.pos).copied().ok_or_else(|| SchemaError {
            span: Span::locate(self.source, self.source.len()),
            kind: SchemaErrorKind::UnexpectedEof {
                expected: expected.to_owned(),
            },
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, expected: &str, token: &Token) -> SchemaError {
        SchemaError {
            span: Span::locate(self.source, token.offset),
            kind: SchemaErrorKind::UnexpectedToken {
                expected: expected.to_owned(),
                found: token.kind.to_string(),
            },
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), SchemaError> {
        let expected = format!("`{c}`");
        let token = self.next(&expected)?;
        if token.kind == TokenKind::Punct(c) {
            Ok(())
        } else {
            self.pos -= 1;
            Err(self.unexpected(&expected, &token))
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Some(token) if token.kind == TokenKind::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<Spanned<String>, SchemaError> {
        let token = self.next(expected)?;
        match token.kind {
            TokenKind::Ident(name) => Ok(Spanned {
                value: name.to_owned(),
                offset: token.offset,
            }),
            _ => {
                self.pos -= 1;
                Err(self.unexpected(expected, &token))
            }
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<Spanned<String>, SchemaError> {
        let expected = format!("`{keyword}`");
        let ident = self.expect_ident(&expected)?;
        if ident.value == keyword {
            Ok(ident)
        } else {
            self.pos -= 1;
            let token = self.tokens[self.pos];
            Err(self.unexpected(&expected, &token))
        }
    }
}

fn parse(source: &str, tokens: &[Token]) -> Result<SchemaAst, SchemaError> {
    let mut stream = TokenStream {
        source,
        tokens,
        pos: 0,
    };

    // version = <n>  (optional trailing `;`)
    stream.expect_keyword("version")?;
    stream.expect_punct('=')?;
    let version_token = stream.next("a version number")?;
    let version = match version_token.kind {
        TokenKind::Number(value) => Spanned {
            value,
            offset: version_token.offset,
        },
        _ => {
            return Err(stream.unexpected("a version number", &version_token));
        }
    };
    stream.eat_punct(';');

    // schema <Name> { ... }
    stream.expect_keyword("schema")?;
    let name = stream.expect_ident("a schema name")?;
    stream.expect_punct('{')?;

    let mut enums = Vec::new();
    let mut fns = Vec::new();
    let mut status = Vec::new();

    loop {
        if stream.eat_punct('}') {
            break;
        }

        let keyword = stream.expect_ident("`enum`, `fn`, `status`, or `}`")?;
        match keyword.value.as_str() {
            "enum" => enums.push(parse_enum(&mut stream)?),
            "fn" => fns.push(parse_fn(&mut stream)?),
            "status" => parse_status(&mut stream, &mut status)?,
            _ => {
                stream.pos -= 1;
                let token = stream.tokens[stream.pos];
                return Err(stream.unexpected("`enum`, `fn`, `status`, or `}`", &token));
            }
        }
    }

    if let Some(extra) = stream.peek() {
        return Err(stream.unexpected("end of input", extra));
    }

    Ok(SchemaAst {
        version,
        name,
        enums,
        fns,
        status,
    })
}

fn parse_enum(stream: &mut TokenStream) -> Result<EnumDecl, SchemaError> {
    let name = stream.expect_ident("an enum name")?;
    stream.expect_punct('{')?;

    let mut members = Vec::new();
    loop {
        if stream.eat_punct('}') {
            break;
        }
        members.push(stream.expect_ident("a member name or `}`")?);
        if !stream.eat_punct(',') {
            stream.expect_punct('}')?;
            break;
        }
    }

    Ok(EnumDecl { name, members })
}

fn parse_fn(stream: &mut TokenStream) -> Result<FnDecl, SchemaError> {
    let name = stream.expect_ident("a command name")?;
    stream.expect_punct('(')?;

    let mut params = Vec::new();
    loop {
        if stream.eat_punct(')') {
            break;
        }
        let ty = stream.expect_ident("a parameter type or `)`")?;
        let param = stream.expect_ident("a parameter name")?;
        params.push((ty, param));
        if !stream.eat_punct(',') {
            stream.expect_punct(')')?;
            break;
        }
    }
    stream.expect_punct(';')?;

    Ok(FnDecl { name, params })
}

fn parse_status(
    stream: &mut TokenStream,
    fields: &mut Vec<(Spanned<String>, Spanned<String>)>,
) -> Result<(), SchemaError> {
    stream.expect_punct('{')?;

    loop {
        if stream.eat_punct('}') {
            break;
        }
        let ty = stream.expect_ident("a field type or `}`")?;
        let field = stream.expect_ident("a field name")?;
        stream.expect_punct(';')?;
        fields.push((ty, field));
    }

    Ok(())
}

// -------------------------------------------------------------------------
// Lowering (semantic; accumulates errors)
// -------------------------------------------------------------------------

fn lower(source: &str, ast: SchemaAst) -> Result<Schema, Vec<SchemaError>> {
    let mut errors = Vec::new();
    let mut report = |offset: usize, kind: SchemaErrorKind| {
        errors.push(SchemaError {
            span: Span::locate(source, offset),
            kind,
        });
    };

    if ast.version.value != u64::from(SCHEMA_VERSION) {
        report(
            ast.version.offset,
            SchemaErrorKind::UnsupportedVersion {
                version: ast.version.value,
            },
        );
    }

    let mut enums: Vec<EnumType> = Vec::new();
    for decl in &ast.enums {
        if is_reserved(&decl.name.value) || lookup_enum(&enums, &decl.name.value).is_some() {
            report(
                decl.name.offset,
                SchemaErrorKind::Duplicate {
                    name: decl.name.value.clone(),
                },
            );
            continue;
        }
        if decl.members.is_empty() {
            report(
                decl.name.offset,
                SchemaErrorKind::EmptyEnum {
                    name: decl.name.value.clone(),
                },
            );
            continue;
        }

        let mut members: Vec<String> = Vec::new();
        for member in &decl.members {
            if members.contains(&member.value) {
                report(
                    member.offset,
                    SchemaErrorKind::Duplicate {
                        name: member.value.clone(),
                    },
                );
            } else {
                members.push(member.value.clone());
            }
        }

        match EnumType::new(decl.name.value.clone(), members) {
            Ok(enum_type) => enums.push(enum_type),
            Err(error) => report(decl.name.offset, SchemaErrorKind::Validation(error)),
        }
    }

    let resolve = |spanned: &Spanned<String>, errors: &mut Vec<SchemaError>| -> Type {
        let name = spanned.value.as_str();
        if name.eq_ignore_ascii_case("int") {
            Type::Int
        } else if name.eq_ignore_ascii_case("bool") {
            Type::Bool
        } else if let Some(enum_type) = lookup_enum(&enums, name) {
            Type::Enum(enum_type.name().to_owned())
        } else {
            errors.push(SchemaError {
                span: Span::locate(source, spanned.offset),
                kind: SchemaErrorKind::UnknownType {
                    name: spanned.value.clone(),
                },
            });
            // Placeholder so lowering can continue collecting errors.
            Type::Int
        }
    };

    let mut commands: Vec<(String, Signature)> = Vec::new();
    for decl in &ast.fns {
        let duplicate = commands.iter().any(|(name, _)| *name == decl.name.value);
        if duplicate {
            errors.push(SchemaError {
                span: Span::locate(source, decl.name.offset),
                kind: SchemaErrorKind::Duplicate {
                    name: decl.name.value.clone(),
                },
            });
            continue;
        }

        let mut params: Vec<Parameter> = Vec::new();
        for (ty, param) in &decl.params {
            if params.iter().any(|p| p.name == param.value) {
                errors.push(SchemaError {
                    span: Span::locate(source, param.offset),
                    kind: SchemaErrorKind::Duplicate {
                        name: param.value.clone(),
                    },
                });
                continue;
            }
            let ty = resolve(ty, &mut errors);
            params.push(Parameter {
                name: param.value.clone(),
                ty,
            });
        }

        match Signature::new(params) {
            Ok(signature) => commands.push((decl.name.value.clone(), signature)),
            Err(error) => errors.push(SchemaError {
                span: Span::locate(source, decl.name.offset),
                kind: SchemaErrorKind::Validation(error),
            }),
        }
    }

    let mut status_fields: Vec<Parameter> = Vec::new();
    for (ty, field) in &ast.status {
        if status_fields.iter().any(|p| p.name == field.value) {
            errors.push(SchemaError {
                span: Span::locate(source, field.offset),
                kind: SchemaErrorKind::Duplicate {
                    name: field.value.clone(),
                },
            });
            continue;
        }
        let ty = resolve(ty, &mut errors);
        status_fields.push(Parameter {
            name: field.value.clone(),
            ty,
        });
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let status = Signature::new(status_fields).map_err(|error| {
        vec![SchemaError {
            span: Span::locate(source, ast.name.offset),
            kind: SchemaErrorKind::Validation(error),
        }]
    })?;

    Schema::new(
        SCHEMA_VERSION,
        ast.name.value.clone(),
        enums,
        commands,
        status,
    )
    .map_err(|error| {
        vec![SchemaError {
            span: Span::locate(source, ast.name.offset),
            kind: SchemaErrorKind::Validation(error),
        }]
    })
}

fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case("int") || name.eq_ignore_ascii_case("bool")
}

fn lookup_enum<'a>(enums: &'a [EnumType], name: &str) -> Option<&'a EnumType> {
    enums.iter().find(|e| e.name().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
version = 1

schema Transceiver {
    enum Vfo { Current, A, B, Unknown }
    enum Mode { LSB, USB, CW, }

    fn set_freq(int freq);
    fn set_vfo(Vfo vfo);
    fn set_transmit(bool transmit);

    status {
        int freq;
        mode mode;
        bool transmit;
    }
}
";

    #[test]
    fn test_compile_ok() {
        let schema = compile(SOURCE).unwrap();

        assert_eq!("Transceiver", schema.kind());
        assert_eq!(2, schema.enums().len());
        assert!(schema.enum_type("Vfo").unwrap().has_member("Unknown"));

        let set_vfo = schema.command("set_vfo").unwrap();
        assert_eq!(
            Some(&Type::Enum("Vfo".into())),
            set_vfo.get("vfo").map(|p| &p.ty)
        );

        // `mode` resolves to enum `Mode` case-insensitively.
        assert_eq!(
            Some(&Type::Enum("Mode".into())),
            schema.status().get("mode").map(|p| &p.ty)
        );
        assert_eq!(3, schema.status().len());
    }

    #[test]
    fn test_structural_error_has_position() {
        // Missing `;` after the fn declaration.
        let source = "version = 1\nschema S {\n    fn set_freq(int freq)\n}\n";
        let errors = compile(source).unwrap_err();

        assert_eq!(1, errors.len());
        let error = &errors[0];
        assert!(matches!(error.kind, SchemaErrorKind::UnexpectedToken { .. }));
        assert_eq!(4, error.span.line);
        assert_eq!(1, error.span.column);
    }

    #[test]
    fn test_semantic_errors_accumulate() {
        let source = "\
version = 2
schema S {
    enum Empty { }
    fn a(int x, int x);
    fn b(Missing y);
}
";
        let errors = compile(source).unwrap_err();

        let kinds: Vec<_> = errors.iter().map(|e| &e.kind).collect();
        assert!(kinds
            .iter()
            .any(|k| matches!(k, SchemaErrorKind::UnsupportedVersion { version: 2 })));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, SchemaErrorKind::EmptyEnum { .. })));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, SchemaErrorKind::Duplicate { name } if name == "x")));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, SchemaErrorKind::UnknownType { name } if name == "Missing")));
        assert_eq!(4, errors.len());
    }

    #[test]
    fn test_lexical_error() {
        let errors = compile("version = 1\nschema S { % }").unwrap_err();
        assert!(matches!(
            errors[0].kind,
            SchemaErrorKind::UnrecognizedChar { found: '%' }
        ));
        assert_eq!(2, errors[0].span.line);
        assert_eq!(12, errors[0].span.column);
    }

    #[test]
    fn test_comments_and_commas() {
        let source = "\
# HolyRig test schema
version = 1;
schema S {
    enum E { A, B, } # trailing comma
    fn f(E e,);
    status { }
}
";
        let schema = compile(source).unwrap();
        assert!(schema.command("f").is_some());
        assert!(schema.status().is_empty());
    }
}
