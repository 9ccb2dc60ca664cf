// src/settings/mod.rs
//! Typed card settings and their translation into register writes
//!
//! Settings objects do no I/O. A card validates them against its
//! [`HardwareProfile`] and then applies the write sequence produced by
//! [`to_register_writes`] in order, so an invalid object never causes a
//! partial write.

pub mod acquisition;
pub mod clock;
pub mod generation;
pub mod io_line;
pub mod pulse_generator;
pub mod trigger;

pub use acquisition::{AcquisitionMode, AcquisitionSettings, InputImpedance};
pub use clock::ClockMode;
pub use generation::{GenerationMode, GenerationSettings, OutputFilter, StopLevel};
pub use io_line::IoLineMode;
pub use pulse_generator::{
    PulseGeneratorMode, PulseGeneratorMultiplexer1, PulseGeneratorMultiplexer2, PulseGeneratorOutputSettings,
    PulseGeneratorTriggerDetection, PulseGeneratorTriggerSettings,
};
pub use trigger::{ChannelTrigger, ExternalTrigger, TriggerDetection, TriggerSettings, TriggerSource};

use crate::config::limits;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, command};
use crate::hal::{HardwareProfile, Register};

/// One register write
pub type RegisterWrite = (Register, i64);

/// Mode-level settings applied by `configure`
pub trait CardSettings {
    /// Sampling clock source
    fn clock(&self) -> ClockMode;

    /// Check every rule against the card; no side effects
    fn validate(&self, profile: &HardwareProfile) -> CardResult<()>;

    /// Channel, rate, length and mode registers in hardware order
    fn register_writes(&self, profile: &HardwareProfile) -> Vec<RegisterWrite>;
}

/// Validate `settings` and `trigger`, then derive the complete write sequence
///
/// Order: clock, trigger, channel enable, per-channel registers, rate,
/// timeout, length registers, mode, timestamp command, write-setup.
pub fn to_register_writes<S: CardSettings>(
    settings: &S,
    trigger: &TriggerSettings,
    profile: &HardwareProfile,
) -> CardResult<Vec<RegisterWrite>> {
    trigger.validate(profile)?;
    settings.validate(profile)?;
    let mut writes = settings.clock().register_writes();
    writes.extend(trigger.register_writes());
    writes.extend(settings.register_writes(profile));
    writes.push((registers::CARD_COMMAND, command::WRITE_SETUP));
    Ok(writes)
}

/// Bitmap of channel indices
pub fn channel_mask(channels: &[u8]) -> i64 {
    channels.iter().fold(0, |mask, &ch| mask | (1i64 << ch))
}

// Shared by acquisition and generation settings
pub(crate) fn validate_channels(channels: &[u8], profile: &HardwareProfile) -> CardResult<()> {
    if !limits::ALLOWED_ENABLED_CHANNEL_COUNTS.contains(&channels.len()) {
        return Err(CardError::config(
            ConfigRule::EnabledChannelCount,
            format!("{} channels enabled, must be 1, 2, 4 or 8", channels.len()),
        ));
    }
    let mut seen = 0i64;
    for &channel in channels {
        if usize::from(channel) >= profile.num_channels() {
            return Err(CardError::config(
                ConfigRule::ChannelNotPresent,
                format!("channel {} not on a {}-channel card", channel, profile.num_channels()),
            ));
        }
        if seen & (1 << channel) != 0 {
            return Err(CardError::config(
                ConfigRule::EnabledChannelCount,
                format!("channel {} enabled twice", channel),
            ));
        }
        seen |= 1 << channel;
    }
    Ok(())
}

pub(crate) fn check_array_length(name: &str, actual: usize, channels: usize) -> CardResult<()> {
    if actual == channels {
        Ok(())
    } else {
        Err(CardError::config(
            ConfigRule::ChannelArrayLength,
            format!("{} has {} entries for {} enabled channels", name, actual, channels),
        ))
    }
}
