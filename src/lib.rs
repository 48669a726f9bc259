#![cfg_attr(docsrs, feature(doc_cfg))]
//! # spbms_lib
//!
//! This crate talks to SP protocol battery management systems over CAN.
//!
//! A pack is reached with *sentinel* framing, packets travel between a start
//! and an end frame. Multi node buses additionally use *addressed* framing,
//! where every frame carries the node id and a position marker. The
//! [`client::SpBms`] client runs both on any [`transport::Bus`].
//!
//! Decoders are plain functions over validated payloads and can be used
//! without a bus, as can the [`identifier`] codec.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `spbms` command-line tool and pulls in `serialport` and `serde`.
//! - `serialport`: Enables [`slcan::SlcanBus`], a serial line CAN adapter driver using the `serialport` crate.
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `spbms` binary executable.

/// Contains error types for the library.
mod error;
pub(crate) mod fields;

pub mod calibration;
pub mod client;
pub mod device;
pub mod framer;
pub mod history;
pub mod identifier;
pub mod node;
pub mod parameters;
/// SP packet envelope and command catalog.
pub mod protocol;
pub mod status;
pub mod transport;

pub use error::{Error, Malformed, Result};

/// Serial line CAN adapter.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod slcan;
