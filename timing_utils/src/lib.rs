//! # Timing Utilities
//!
//! File formats used when talking to timing-system hardware: the address tables that name the
//! firmware registers and the register exports used to program on-board clock chips.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod address_table;
pub mod clock_config;
