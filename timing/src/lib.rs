//! A hardware access layer for the boards and firmware of the DUNE timing system.
//!
//! Registers are addressed by dotted names resolved through an address table ([`hw::Hw`]), grouped
//! into nodes ([`node::Node`]) and wrapped by typed drivers for the firmware blocks
//! ([`nodes`]), the I2C devices on the boards ([`i2c`]) and whole firmware designs ([`design`]).
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod definitions;
pub mod design;
pub mod format;
pub mod hw;
pub mod i2c;
pub mod node;
pub mod nodes;
pub mod prelude;
pub mod transport;
