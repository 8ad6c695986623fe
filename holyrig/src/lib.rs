//! # HolyRig — schema-driven CAT control
//!
//! HolyRig mediates between client applications and amateur-radio
//! transceivers on serial links. Radios are described declaratively: a
//! *schema* names the command surface (see [`schema`]), a per-radio *model*
//! binds it to concrete byte frames (see [`model`]), and the [`codec`]
//! interprets those frames in both directions. Adding a radio is writing a
//! model file, never writing code.
//!
//! The runtime side runs one [`rig`] task per radio over a byte-duplex
//! [`link`], a [`dispatch`]er routing JSON-RPC requests, and a
//! [`subscribe`] manager pushing status-change notifications. The transport
//! is JSON-RPC 2.0 over UDP ([`rpc`]).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let schema = Arc::new(holyrig::schema::compile(
//!     "version = 1\nschema Transceiver { fn set_freq(int freq); status { int freq; } }",
//! ).unwrap());
//!
//! let model = holyrig::model::compile(r#"
//! [general]
//! type = "transceiver"
//! version = 1
//!
//! [commands.set_freq]
//! command = "FE.FE.94.E0.05.??.??.??.??.FD"
//!
//! [commands.set_freq.params.freq]
//! index = 5
//! format = "bcd_lu"
//! "#, schema).unwrap();
//!
//! let mut args = std::collections::BTreeMap::new();
//! args.insert("freq".to_owned(), holyrig_types::Value::Int(14_250_000));
//! let frame = holyrig::codec::encode_command(&model, "set_freq", &args).unwrap();
//! assert_eq!("FE.FE.94.E0.05.00.00.25.14.FD", holyrig_types::utils::hex_frame(&frame));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod link;
pub mod model;
pub mod rig;
pub mod rpc;
pub mod schema;
pub mod span;
pub mod subscribe;

pub use holyrig_types as types;
