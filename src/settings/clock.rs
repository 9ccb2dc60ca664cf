// src/settings/clock.rs
//! Sampling clock source

use serde::{Deserialize, Serialize};

use super::RegisterWrite;
use crate::hal::registers::{self, clock_mode};

/// Where the sampling clock comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockMode {
    /// On-board PLL
    #[default]
    InternalPll,
    /// Sample clock fed in directly
    ExternalClock,
    /// PLL locked to an external reference
    ExternalReference {
        /// Reference frequency in Hz
        frequency_hz: u64,
    },
}

impl ClockMode {
    /// Clock registers, written before the sample rate
    pub fn register_writes(self) -> Vec<RegisterWrite> {
        match self {
            ClockMode::InternalPll => vec![(registers::CLOCK_MODE, clock_mode::INTERNAL_PLL)],
            ClockMode::ExternalClock => vec![(registers::CLOCK_MODE, clock_mode::EXTERNAL)],
            ClockMode::ExternalReference { frequency_hz } => vec![
                (registers::CLOCK_MODE, clock_mode::EXTERNAL_REFERENCE),
                (registers::REFERENCE_CLOCK, frequency_hz as i64),
            ],
        }
    }
}
