// src/settings/pulse_generator.rs
//! Pulse generator trigger and output settings

use serde::{Deserialize, Serialize};

use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::pulsegen;

/// How the generator reacts to its trigger condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PulseGeneratorMode {
    /// Runs while the condition holds
    #[default]
    Gated,
    /// Replays its pulses on every trigger
    Triggered,
    /// Replays its pulses once
    SingleShot,
}

impl PulseGeneratorMode {
    /// Mode register value
    pub fn register_value(self) -> i64 {
        match self {
            PulseGeneratorMode::Gated => pulsegen::MODE_GATED,
            PulseGeneratorMode::Triggered => pulsegen::MODE_TRIGGERED,
            PulseGeneratorMode::SingleShot => pulsegen::MODE_SINGLE_SHOT,
        }
    }

    /// Decode a mode register value
    pub fn from_register(value: i64) -> Option<Self> {
        [Self::Gated, Self::Triggered, Self::SingleShot]
            .into_iter()
            .find(|m| m.register_value() == value)
    }
}

/// Trigger condition detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PulseGeneratorTriggerDetection {
    /// Rising edge of the combined condition
    #[default]
    RisingEdge,
    /// Condition level high
    High,
}

/// First multiplexer input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PulseGeneratorMultiplexer1 {
    /// Static high
    #[default]
    Unused,
    /// Card run state
    RunState,
    /// Card arm state
    ArmState,
}

impl PulseGeneratorMultiplexer1 {
    /// Source register value
    pub fn register_value(self) -> i64 {
        match self {
            PulseGeneratorMultiplexer1::Unused => pulsegen::MUX1_UNUSED,
            PulseGeneratorMultiplexer1::RunState => pulsegen::MUX1_RUN_STATE,
            PulseGeneratorMultiplexer1::ArmState => pulsegen::MUX1_ARM_STATE,
        }
    }

    /// Decode a source register value
    pub fn from_register(value: i64) -> Option<Self> {
        [Self::Unused, Self::RunState, Self::ArmState]
            .into_iter()
            .find(|m| m.register_value() == value)
    }
}

/// Second multiplexer input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PulseGeneratorMultiplexer2 {
    /// Static high
    #[default]
    Unused,
    /// Host-forced trigger
    Software,
    /// Output of another pulse generator
    PulseGenerator(u8),
    /// I/O line input
    IoLine(u8),
}

impl PulseGeneratorMultiplexer2 {
    /// Source register value
    pub fn register_value(self) -> i64 {
        match self {
            PulseGeneratorMultiplexer2::Unused => pulsegen::MUX2_UNUSED,
            PulseGeneratorMultiplexer2::Software => pulsegen::MUX2_SOFTWARE,
            PulseGeneratorMultiplexer2::PulseGenerator(n) => pulsegen::MUX2_PULSEGEN0 + i64::from(n),
            PulseGeneratorMultiplexer2::IoLine(n) => pulsegen::MUX2_XIO0 + i64::from(n),
        }
    }

    /// Decode a source register value
    pub fn from_register(value: i64) -> Option<Self> {
        match value {
            pulsegen::MUX2_UNUSED => Some(Self::Unused),
            pulsegen::MUX2_SOFTWARE => Some(Self::Software),
            v if (pulsegen::MUX2_PULSEGEN0..pulsegen::MUX2_XIO0).contains(&v) => {
                Some(Self::PulseGenerator((v - pulsegen::MUX2_PULSEGEN0) as u8))
            }
            v if (pulsegen::MUX2_XIO0..pulsegen::MUX2_XIO0 + 4).contains(&v) => {
                Some(Self::IoLine((v - pulsegen::MUX2_XIO0) as u8))
            }
            _ => None,
        }
    }

    fn index(self) -> Option<u8> {
        match self {
            PulseGeneratorMultiplexer2::PulseGenerator(n) | PulseGeneratorMultiplexer2::IoLine(n) => Some(n),
            _ => None,
        }
    }
}

/// Trigger setup of one pulse generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PulseGeneratorTriggerSettings {
    pub mode: PulseGeneratorMode,
    pub detection: PulseGeneratorTriggerDetection,
    pub multiplexer_1: PulseGeneratorMultiplexer1,
    pub multiplexer_1_inverted: bool,
    pub multiplexer_2: PulseGeneratorMultiplexer2,
    pub multiplexer_2_inverted: bool,
}

impl PulseGeneratorTriggerSettings {
    /// Fire on host request only
    pub fn software(mode: PulseGeneratorMode) -> Self {
        Self {
            mode,
            multiplexer_2: PulseGeneratorMultiplexer2::Software,
            ..Self::default()
        }
    }

    /// Reject source indices beyond the four generators and lines
    pub fn validate(&self) -> CardResult<()> {
        match self.multiplexer_2.index() {
            Some(n) if n >= 4 => Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("multiplexer 2 source {:?} does not exist", self.multiplexer_2),
            )),
            _ => Ok(()),
        }
    }

    /// Config register bits owned by the trigger setup
    pub fn config_bits(&self) -> i64 {
        let mut bits = 0;
        if self.multiplexer_1_inverted {
            bits |= pulsegen::CONFIG_MUX1_INVERT;
        }
        if self.multiplexer_2_inverted {
            bits |= pulsegen::CONFIG_MUX2_INVERT;
        }
        if self.detection == PulseGeneratorTriggerDetection::High {
            bits |= pulsegen::CONFIG_HIGH;
        }
        bits
    }
}

/// Output waveform of one pulse generator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseGeneratorOutputSettings {
    pub period_s: f64,
    /// High fraction of the period, 0 to 1
    pub duty_cycle: f64,
    /// Pulses per trigger, 0 pulses continuously
    pub num_pulses: u64,
    /// Delay between trigger and first pulse
    pub delay_s: f64,
    pub inverted: bool,
}

impl Default for PulseGeneratorOutputSettings {
    fn default() -> Self {
        Self {
            period_s: 1e-6,
            duty_cycle: 0.5,
            num_pulses: 0,
            delay_s: 0.0,
            inverted: false,
        }
    }
}

impl PulseGeneratorOutputSettings {
    /// Reject values no coercion can fix
    pub fn validate(&self) -> CardResult<()> {
        if !(self.period_s > 0.0) || !self.period_s.is_finite() {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("period {} s must be positive", self.period_s),
            ));
        }
        if !(0.0..=1.0).contains(&self.duty_cycle) {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("duty cycle {} outside 0..=1", self.duty_cycle),
            ));
        }
        if !(self.delay_s >= 0.0) || !self.delay_s.is_finite() {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("delay {} s must be non-negative", self.delay_s),
            ));
        }
        Ok(())
    }
}

/// Legal range of a generator register in clock cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleLimits {
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

impl CycleLimits {
    /// Nearest legal value: rounded to the step, then clamped
    pub fn coerce(&self, value: f64) -> i64 {
        let step = self.step.max(1);
        let stepped = (value / step as f64).round() as i64 * step;
        stepped.clamp(self.min, self.max.max(self.min))
    }
}
