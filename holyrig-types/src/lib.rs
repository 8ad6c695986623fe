//! # Data structures for schema-driven CAT control
//!
//! This crate provides the data model of HolyRig, a service that drives
//! amateur-radio transceivers over serial CAT protocols from declarative
//! descriptions. Nothing here performs I/O: a [`schema::Schema`] describes a
//! command surface, a [`model::Model`] binds it to the byte layout of one
//! radio, and [`frame::FrameTemplate`] is the unit the codec interprets.
//!
//! Most types validate on construction, so holding a value means its
//! invariants hold: schema names are unique, field bindings cover unknown
//! frame bytes only, and every model refers only to things its schema
//! declares.

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]

pub mod core;
pub mod error;
pub mod frame;
pub mod model;
pub mod schema;
pub mod state;
pub mod utils;

pub use crate::{
    core::{Type, Value},
    error::ValidationError,
    frame::{ByteSlot, FieldSpec, Format, FrameTemplate, ReplySpec},
    model::{EnumMapping, Model, StatusPoll, TransformOrder},
    schema::{EnumType, Parameter, Schema, Signature},
    state::RigState,
};
