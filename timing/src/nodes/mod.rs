//! The register-map nodes of timing firmware

pub mod endpoint;
pub mod frequency;
pub mod io;
pub mod master;
pub mod partition;
pub mod spill;
pub mod trigger_receiver;
