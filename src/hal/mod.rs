// src/hal/mod.rs
//! Register-level boundary to the card driver

pub mod error_codes;
pub mod profile;
pub mod registers;
pub mod traits;
pub mod types;
pub mod waveform_source;

#[cfg(feature = "simulation")]
pub mod mock;

pub use profile::{CardKind, HardwareProfile};
pub use registers::{Register, RegisterFamily};
pub use traits::*;
pub use types::*;
