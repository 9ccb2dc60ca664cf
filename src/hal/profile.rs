// src/hal/profile.rs
//! Fixed capabilities of one card, read once at connect

use serde::{Deserialize, Serialize};

use super::registers::{self, features, function_type};
use super::traits::RegisterInterface;
use super::types::{FaultCode, HalResult};

/// Acquisition or generation hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardKind {
    /// Analog input
    Digitiser,
    /// Analog output
    Awg,
}

/// Capabilities reported by the card's read-only registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub kind: CardKind,
    pub card_type: i64,
    pub serial_number: i64,
    pub modules: usize,
    pub channels_per_module: usize,
    pub bytes_per_sample: usize,
    pub max_adc_value: i64,
    /// Pre-trigger memory per channel, in samples
    pub pretrigger_limit: u64,
    /// Length granularity of on-board memory, in samples
    pub memory_step: u64,
    pub features: i64,
    pub ext_features: i64,
}

impl HardwareProfile {
    /// Read the profile from an open card
    pub fn read(regs: &dyn RegisterInterface) -> HalResult<Self> {
        let kind = match regs.read(registers::FUNCTION_TYPE)? {
            function_type::ANALOG_IN => CardKind::Digitiser,
            function_type::ANALOG_OUT => CardKind::Awg,
            _ => return Err(FaultCode::TYPE),
        };
        let count = |value: i64| usize::try_from(value).map_err(|_| FaultCode::VALUE);
        Ok(Self {
            kind,
            card_type: regs.read(registers::CARD_TYPE)?,
            serial_number: regs.read(registers::SERIAL_NUMBER)?,
            modules: count(regs.read(registers::MODULES)?)?,
            channels_per_module: count(regs.read(registers::CHANNELS_PER_MODULE)?)?,
            bytes_per_sample: count(regs.read(registers::BYTES_PER_SAMPLE)?)?,
            max_adc_value: regs.read(registers::MAX_ADC_VALUE)?,
            pretrigger_limit: regs.read(registers::PRETRIGGER_LIMIT)?.max(0) as u64,
            memory_step: regs.read(registers::MEMORY_STEP)?.max(1) as u64,
            features: regs.read(registers::FEATURES)?,
            ext_features: regs.read(registers::EXT_FEATURES)?,
        })
    }

    /// Profile of an 8-channel digitiser, two modules of four
    pub fn digitiser() -> Self {
        Self {
            kind: CardKind::Digitiser,
            card_type: 0,
            serial_number: 0,
            modules: 2,
            channels_per_module: 4,
            bytes_per_sample: 2,
            max_adc_value: 32767,
            pretrigger_limit: 8192,
            memory_step: 32,
            features: features::MULTI | features::TIMESTAMP | features::STARHUB | features::BASE_XIO,
            ext_features: features::EXT_PULSE_GENERATOR,
        }
    }

    /// Profile of an 8-channel AWG
    pub fn awg() -> Self {
        Self {
            kind: CardKind::Awg,
            ..Self::digitiser()
        }
    }

    /// Total analog channels
    pub fn num_channels(&self) -> usize {
        self.modules * self.channels_per_module
    }

    /// Module holding `channel`
    pub fn module_of(&self, channel: usize) -> usize {
        channel / self.channels_per_module.max(1)
    }

    /// Feature bit present in the feature bitmap
    pub fn has_feature(&self, bits: i64) -> bool {
        self.features & bits == bits
    }

    /// Feature bit present in the extended feature bitmap
    pub fn has_ext_feature(&self, bits: i64) -> bool {
        self.ext_features & bits == bits
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::hal::mock::MockDriver;
    use crate::hal::traits::Driver;

    #[test]
    fn test_profile_from_mock_card() {
        let driver = MockDriver::new();
        let address = driver.add_awg(MockConfig {
            modules: 1,
            channels_per_module: 2,
            ..MockConfig::default()
        });
        let regs = driver.open(&address).unwrap();
        let profile = HardwareProfile::read(regs.as_ref()).unwrap();
        assert_eq!(profile.kind, CardKind::Awg);
        assert_eq!(profile.num_channels(), 2);
        assert!(profile.has_ext_feature(features::EXT_PULSE_GENERATOR));
    }

    #[test]
    fn test_module_of() {
        let profile = HardwareProfile::digitiser();
        assert_eq!(profile.module_of(3), 0);
        assert_eq!(profile.module_of(4), 1);
    }
}
