// src/device/pulse_generator.rs
//! Pulse generators on the multi-purpose I/O lines
//!
//! A generator shares the card's handle but not its lifecycle: it can be
//! configured, enabled and triggered whether or not an acquisition or
//! generation is running, as long as the card stays connected.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::limits;
use crate::error::{CardError, CardResult, ConfigRule, IntoCardError};
use crate::hal::registers::{self, command, features, pulsegen};
use crate::hal::{FaultCode, HardwareProfile, Register, RegisterInterface};
use crate::settings::pulse_generator::CycleLimits;
use crate::settings::{
    PulseGeneratorMode, PulseGeneratorMultiplexer1, PulseGeneratorMultiplexer2, PulseGeneratorOutputSettings,
    PulseGeneratorTriggerDetection, PulseGeneratorTriggerSettings,
};

/// One of the card's four pulse generators
pub struct PulseGenerator {
    io: Arc<dyn RegisterInterface>,
    index: usize,
    clock_hz: f64,
}

impl PulseGenerator {
    pub(crate) fn new(io: Arc<dyn RegisterInterface>, profile: &HardwareProfile, index: u8) -> CardResult<Self> {
        if !profile.has_ext_feature(features::EXT_PULSE_GENERATOR) {
            return Err(CardError::config(
                ConfigRule::FeatureNotSupported,
                "card has no pulse generators",
            ));
        }
        let index = usize::from(index);
        if index >= limits::PULSE_GENERATORS {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("pulse generator {} does not exist", index),
            ));
        }
        let clock = io.read(registers::PULSEGEN_CLOCK).on_register(registers::PULSEGEN_CLOCK)?;
        if clock <= 0 {
            return Err(CardError::from_fault(FaultCode::VALUE, registers::PULSEGEN_CLOCK.to_string()));
        }
        Ok(Self {
            io,
            index,
            clock_hz: clock as f64,
        })
    }

    /// Generator index, equal to its I/O line
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generator clock in Hz
    pub fn clock_hz(&self) -> f64 {
        self.clock_hz
    }

    fn read(&self, register: Register) -> CardResult<i64> {
        self.io.read(register).on_register(register)
    }

    fn write(&self, register: Register, value: i64) -> CardResult<()> {
        self.io.write(register, value).on_register(register)
    }

    fn commit(&self) -> CardResult<()> {
        self.io
            .write(registers::CARD_COMMAND, command::WRITE_SETUP)
            .during("pulse generator write setup")
    }

    fn limits(&self, min: Register, max: Register, step: Register) -> CardResult<CycleLimits> {
        Ok(CycleLimits {
            min: self.read(min)?,
            max: self.read(max)?,
            step: self.read(step)?,
        })
    }

    // Coerce a cycle count to the card's grid, warning when it moves
    fn coerce(&self, what: &str, requested: f64, limits: CycleLimits) -> i64 {
        let applied = limits.coerce(requested);
        if (applied as f64 - requested).abs() >= 0.5 {
            warn!(
                generator = self.index,
                requested,
                applied,
                "pulse generator {} coerced to a legal cycle count",
                what
            );
        }
        applied
    }

    /// Write trigger mode, detection and both multiplexer sources
    pub fn configure_trigger(&self, settings: &PulseGeneratorTriggerSettings) -> CardResult<()> {
        settings.validate()?;
        let inverted = self.read(registers::PULSEGEN_CONFIG.at(self.index))? & pulsegen::CONFIG_INVERT;
        self.write(registers::PULSEGEN_MODE.at(self.index), settings.mode.register_value())?;
        self.write(
            registers::PULSEGEN_MUX1.at(self.index),
            settings.multiplexer_1.register_value(),
        )?;
        self.write(
            registers::PULSEGEN_MUX2.at(self.index),
            settings.multiplexer_2.register_value(),
        )?;
        self.write(registers::PULSEGEN_CONFIG.at(self.index), settings.config_bits() | inverted)?;
        debug!(generator = self.index, ?settings, "pulse generator trigger configured");
        self.commit()
    }

    /// Convert period, duty cycle, count and delay to cycles and write them
    pub fn configure_output(&self, settings: &PulseGeneratorOutputSettings) -> CardResult<()> {
        settings.validate()?;
        let len_limits = self.limits(
            registers::PULSEGEN_LEN_MIN,
            registers::PULSEGEN_LEN_MAX,
            registers::PULSEGEN_LEN_STEP,
        )?;
        let high_limits = self.limits(
            registers::PULSEGEN_HIGH_MIN,
            registers::PULSEGEN_HIGH_MAX,
            registers::PULSEGEN_HIGH_STEP,
        )?;
        let loops_limits = self.limits(
            registers::PULSEGEN_LOOPS_MIN,
            registers::PULSEGEN_LOOPS_MAX,
            registers::PULSEGEN_LOOPS_STEP,
        )?;
        let delay_limits = self.limits(
            registers::PULSEGEN_DELAY_MIN,
            registers::PULSEGEN_DELAY_MAX,
            registers::PULSEGEN_DELAY_STEP,
        )?;

        let period = self.coerce("period", settings.period_s * self.clock_hz, len_limits);
        let high = self.coerce("high time", settings.duty_cycle * period as f64, high_limits);
        let loops = self.coerce("pulse count", settings.num_pulses as f64, loops_limits);
        let delay = self.coerce("delay", settings.delay_s * self.clock_hz, delay_limits);

        let config = self.read(registers::PULSEGEN_CONFIG.at(self.index))?;
        let config = if settings.inverted {
            config | pulsegen::CONFIG_INVERT
        } else {
            config & !pulsegen::CONFIG_INVERT
        };
        self.write(registers::PULSEGEN_LEN.at(self.index), period)?;
        self.write(registers::PULSEGEN_HIGH.at(self.index), high)?;
        self.write(registers::PULSEGEN_LOOPS.at(self.index), loops)?;
        self.write(registers::PULSEGEN_DELAY.at(self.index), delay)?;
        self.write(registers::PULSEGEN_CONFIG.at(self.index), config)?;
        debug!(generator = self.index, period, high, loops, delay, "pulse generator output configured");
        self.commit()
    }

    pub fn enable(&self) -> CardResult<()> {
        self.set_enabled(true)
    }

    pub fn disable(&self) -> CardResult<()> {
        self.set_enabled(false)
    }

    fn set_enabled(&self, enabled: bool) -> CardResult<()> {
        let bit = 1i64 << self.index;
        let mask = self.read(registers::PULSEGEN_ENABLE)?;
        let mask = if enabled { mask | bit } else { mask & !bit };
        self.write(registers::PULSEGEN_ENABLE, mask)?;
        debug!(generator = self.index, enabled, "pulse generator enable changed");
        self.commit()
    }

    pub fn is_enabled(&self) -> CardResult<bool> {
        Ok(self.read(registers::PULSEGEN_ENABLE)? & (1 << self.index) != 0)
    }

    /// Fire the generator from the host; needs the software source on multiplexer 2
    pub fn force_trigger(&self) -> CardResult<()> {
        if self.multiplexer_2()? != PulseGeneratorMultiplexer2::Software {
            return Err(CardError::config(
                ConfigRule::SoftwareTriggerRequired,
                format!("pulse generator {} is not triggered by software", self.index),
            ));
        }
        self.write(registers::PULSEGEN_COMMAND, pulsegen::COMMAND_FORCE)
    }

    /// Period in seconds as programmed
    pub fn period_s(&self) -> CardResult<f64> {
        Ok(self.read(registers::PULSEGEN_LEN.at(self.index))? as f64 / self.clock_hz)
    }

    /// High fraction of the period as programmed
    pub fn duty_cycle(&self) -> CardResult<f64> {
        let period = self.read(registers::PULSEGEN_LEN.at(self.index))?;
        let high = self.read(registers::PULSEGEN_HIGH.at(self.index))?;
        Ok(if period > 0 { high as f64 / period as f64 } else { 0.0 })
    }

    pub fn num_pulses(&self) -> CardResult<u64> {
        Ok(self.read(registers::PULSEGEN_LOOPS.at(self.index))?.max(0) as u64)
    }

    /// Delay in seconds as programmed
    pub fn delay_s(&self) -> CardResult<f64> {
        Ok(self.read(registers::PULSEGEN_DELAY.at(self.index))? as f64 / self.clock_hz)
    }

    pub fn output_inverted(&self) -> CardResult<bool> {
        Ok(self.read(registers::PULSEGEN_CONFIG.at(self.index))? & pulsegen::CONFIG_INVERT != 0)
    }

    pub fn mode(&self) -> CardResult<PulseGeneratorMode> {
        let register = registers::PULSEGEN_MODE.at(self.index);
        let value = self.read(register)?;
        PulseGeneratorMode::from_register(value)
            .ok_or_else(|| CardError::from_fault(FaultCode::VALUE, register.to_string()))
    }

    pub fn multiplexer_1(&self) -> CardResult<PulseGeneratorMultiplexer1> {
        let register = registers::PULSEGEN_MUX1.at(self.index);
        let value = self.read(register)?;
        PulseGeneratorMultiplexer1::from_register(value)
            .ok_or_else(|| CardError::from_fault(FaultCode::VALUE, register.to_string()))
    }

    pub fn multiplexer_2(&self) -> CardResult<PulseGeneratorMultiplexer2> {
        let register = registers::PULSEGEN_MUX2.at(self.index);
        let value = self.read(register)?;
        PulseGeneratorMultiplexer2::from_register(value)
            .ok_or_else(|| CardError::from_fault(FaultCode::VALUE, register.to_string()))
    }

    /// Trigger setup decoded from the registers
    pub fn trigger_settings(&self) -> CardResult<PulseGeneratorTriggerSettings> {
        let config = self.read(registers::PULSEGEN_CONFIG.at(self.index))?;
        Ok(PulseGeneratorTriggerSettings {
            mode: self.mode()?,
            detection: if config & pulsegen::CONFIG_HIGH != 0 {
                PulseGeneratorTriggerDetection::High
            } else {
                PulseGeneratorTriggerDetection::RisingEdge
            },
            multiplexer_1: self.multiplexer_1()?,
            multiplexer_1_inverted: config & pulsegen::CONFIG_MUX1_INVERT != 0,
            multiplexer_2: self.multiplexer_2()?,
            multiplexer_2_inverted: config & pulsegen::CONFIG_MUX2_INVERT != 0,
        })
    }
}

impl std::fmt::Debug for PulseGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseGenerator")
            .field("index", &self.index)
            .field("clock_hz", &self.clock_hz)
            .finish()
    }
}
