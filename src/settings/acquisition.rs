// src/settings/acquisition.rs
//! Digitiser acquisition settings

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{channel_mask, check_array_length, validate_channels, CardSettings, ClockMode, RegisterWrite};
use crate::config::streaming;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, card_mode, timestamp};
use crate::hal::HardwareProfile;

/// Recording mode of a digitiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// One record in on-board memory, read after the run
    #[default]
    StandardSingle,
    /// Several segments in on-board memory, read after the run
    StandardMulti,
    /// Segments streamed to the host while recording
    FifoMulti,
    /// Averaged segments in on-board memory
    StandardAverage,
    /// Averaged segments streamed to the host
    FifoAverage,
}

impl AcquisitionMode {
    /// Streaming mode
    pub fn is_fifo(self) -> bool {
        matches!(self, AcquisitionMode::FifoMulti | AcquisitionMode::FifoAverage)
    }

    /// Mode recording more than one segment
    pub fn is_segmented(self) -> bool {
        !matches!(self, AcquisitionMode::StandardSingle)
    }

    /// Averaging mode
    pub fn is_averaging(self) -> bool {
        matches!(self, AcquisitionMode::StandardAverage | AcquisitionMode::FifoAverage)
    }

    /// Card mode register value
    pub fn register_value(self) -> i64 {
        match self {
            AcquisitionMode::StandardSingle => card_mode::STD_SINGLE,
            AcquisitionMode::StandardMulti => card_mode::STD_MULTI,
            AcquisitionMode::FifoMulti => card_mode::FIFO_MULTI,
            AcquisitionMode::StandardAverage => card_mode::STD_AVERAGE,
            AcquisitionMode::FifoAverage => card_mode::FIFO_AVERAGE,
        }
    }
}

/// Analog input termination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputImpedance {
    /// 50 ohm termination
    FiftyOhm,
    /// High impedance
    #[default]
    OneMegaOhm,
}

/// Everything `configure` needs for a digitiser run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    pub mode: AcquisitionMode,
    pub sample_rate_hz: u64,
    /// Samples per channel in one record (segment)
    pub acquisition_length: u64,
    /// Samples after the trigger, defaults to the whole record
    #[serde(default)]
    pub post_trigger_length: Option<u64>,
    /// Total on-board memory for standard segmented modes, defaults to one batch
    #[serde(default)]
    pub memory_size: Option<u64>,
    /// Card wait timeout, 0 waits forever
    pub timeout_ms: u32,
    pub enabled_channels: Vec<u8>,
    /// Input range per enabled channel
    pub vertical_ranges_mv: Vec<u32>,
    /// Offset per enabled channel, percent of range
    pub vertical_offsets_percent: Vec<i32>,
    pub input_impedances: Vec<InputImpedance>,
    #[serde(default)]
    pub timestamping: bool,
    /// Records per measurement batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Averages per segment in averaging modes
    #[serde(default)]
    pub number_of_averages: u32,
    #[serde(default)]
    pub clock: ClockMode,
}

fn default_batch_size() -> u64 {
    1
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::StandardSingle,
            sample_rate_hz: 1_000_000,
            acquisition_length: 400,
            post_trigger_length: None,
            memory_size: None,
            timeout_ms: streaming::DEFAULT_TIMEOUT_MS,
            enabled_channels: vec![0],
            vertical_ranges_mv: vec![1000],
            vertical_offsets_percent: vec![0],
            input_impedances: vec![InputImpedance::OneMegaOhm],
            timestamping: false,
            batch_size: 1,
            number_of_averages: 0,
            clock: ClockMode::InternalPll,
        }
    }
}

impl AcquisitionSettings {
    /// FIFO run of `length` samples on `channels`, default ranges
    pub fn fifo(sample_rate_hz: u64, length: u64, channels: &[u8]) -> Self {
        Self {
            mode: AcquisitionMode::FifoMulti,
            sample_rate_hz,
            acquisition_length: length,
            ..Self::default()
        }
        .with_channels(channels)
    }

    /// Standard single run of `length` samples on `channels`, default ranges
    pub fn standard_single(sample_rate_hz: u64, length: u64, channels: &[u8]) -> Self {
        Self {
            sample_rate_hz,
            acquisition_length: length,
            ..Self::default()
        }
        .with_channels(channels)
    }

    /// Enable `channels` with 1 V range, no offset and high impedance
    pub fn with_channels(mut self, channels: &[u8]) -> Self {
        self.enabled_channels = channels.to_vec();
        self.vertical_ranges_mv = vec![1000; channels.len()];
        self.vertical_offsets_percent = vec![0; channels.len()];
        self.input_impedances = vec![InputImpedance::OneMegaOhm; channels.len()];
        self
    }

    /// Post-trigger samples actually used
    pub fn post_trigger(&self) -> u64 {
        self.post_trigger_length.unwrap_or(self.acquisition_length)
    }

    /// Pre-trigger samples implied by the post-trigger length
    pub fn pre_trigger(&self) -> u64 {
        self.acquisition_length.saturating_sub(self.post_trigger())
    }

    /// On-board memory in samples per channel
    pub fn memory_samples(&self) -> u64 {
        match self.mode {
            AcquisitionMode::StandardSingle => self.acquisition_length,
            _ => self
                .memory_size
                .unwrap_or(self.acquisition_length * self.batch_size.max(1)),
        }
    }

    /// Samples across all enabled channels in one record
    pub fn frame_samples(&self) -> usize {
        self.acquisition_length as usize * self.enabled_channels.len()
    }

    /// Copy with FIFO lengths rounded to the FIFO step
    ///
    /// Non-FIFO settings are returned unchanged.
    pub fn coerced_to_fifo_step(&self, step: u64) -> Self {
        let mut coerced = self.clone();
        if !self.mode.is_fifo() || step == 0 {
            return coerced;
        }
        let round = |value: u64| ((value + step / 2) / step).max(1) * step;
        coerced.acquisition_length = round(self.acquisition_length);
        coerced.post_trigger_length = self.post_trigger_length.map(round);
        if coerced.acquisition_length != self.acquisition_length {
            warn!(
                requested = self.acquisition_length,
                applied = coerced.acquisition_length,
                "FIFO acquisition length coerced to a multiple of {}",
                step
            );
        }
        if coerced.post_trigger_length != self.post_trigger_length {
            warn!(
                requested = ?self.post_trigger_length,
                applied = ?coerced.post_trigger_length,
                "FIFO post-trigger length coerced to a multiple of {}",
                step
            );
        }
        coerced
    }
}

impl CardSettings for AcquisitionSettings {
    fn clock(&self) -> ClockMode {
        self.clock
    }

    fn validate(&self, profile: &HardwareProfile) -> CardResult<()> {
        validate_channels(&self.enabled_channels, profile)?;
        let channels = self.enabled_channels.len();
        check_array_length("vertical_ranges_mv", self.vertical_ranges_mv.len(), channels)?;
        check_array_length("vertical_offsets_percent", self.vertical_offsets_percent.len(), channels)?;
        check_array_length("input_impedances", self.input_impedances.len(), channels)?;

        if self.sample_rate_hz == 0 || self.acquisition_length == 0 {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                "sample rate and acquisition length must be non-zero",
            ));
        }
        if let Some(offset) = self.vertical_offsets_percent.iter().find(|o| o.abs() > 100) {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("vertical offset {}% outside ±100%", offset),
            ));
        }

        let post = self.post_trigger();
        if post > self.acquisition_length {
            return Err(CardError::config(
                ConfigRule::PostTriggerExceedsSegment,
                format!("post-trigger {} exceeds segment of {}", post, self.acquisition_length),
            ));
        }
        if self.pre_trigger() > profile.pretrigger_limit {
            return Err(CardError::config(
                ConfigRule::PretriggerTooLong,
                format!(
                    "pre-trigger {} exceeds pretrigger memory of {}",
                    self.pre_trigger(),
                    profile.pretrigger_limit
                ),
            ));
        }
        if self.mode.is_segmented() && !self.mode.is_fifo() && self.memory_samples() % self.acquisition_length != 0 {
            return Err(CardError::config(
                ConfigRule::SegmentMemoryMismatch,
                format!(
                    "memory of {} is not a whole number of {}-sample segments",
                    self.memory_samples(),
                    self.acquisition_length
                ),
            ));
        }

        if self.batch_size == 0 || (self.mode == AcquisitionMode::StandardSingle && self.batch_size != 1) {
            return Err(CardError::config(
                ConfigRule::BatchSize,
                format!("batch size {} not allowed in {:?}", self.batch_size, self.mode),
            ));
        }
        if self.mode.is_averaging() && self.number_of_averages < 2 {
            return Err(CardError::config(
                ConfigRule::Averages,
                format!("{} averages requested, need at least 2", self.number_of_averages),
            ));
        }
        Ok(())
    }

    fn register_writes(&self, _profile: &HardwareProfile) -> Vec<RegisterWrite> {
        let mut writes = vec![(registers::CHANNEL_ENABLE, channel_mask(&self.enabled_channels))];
        for (i, &channel) in self.enabled_channels.iter().enumerate() {
            let channel = usize::from(channel);
            writes.push((registers::AMPLITUDE.at(channel), i64::from(self.vertical_ranges_mv[i])));
            writes.push((registers::OFFSET.at(channel), i64::from(self.vertical_offsets_percent[i])));
            writes.push((
                registers::IMPEDANCE_50_OHM.at(channel),
                i64::from(self.input_impedances[i] == InputImpedance::FiftyOhm),
            ));
        }
        writes.push((registers::SAMPLE_RATE, self.sample_rate_hz as i64));
        writes.push((registers::TIMEOUT, i64::from(self.timeout_ms)));

        let length = self.acquisition_length as i64;
        match self.mode {
            AcquisitionMode::StandardSingle => {
                writes.push((registers::MEMORY_SIZE, length));
            }
            AcquisitionMode::StandardMulti | AcquisitionMode::StandardAverage => {
                writes.push((registers::MEMORY_SIZE, self.memory_samples() as i64));
                writes.push((registers::SEGMENT_SIZE, length));
            }
            AcquisitionMode::FifoMulti | AcquisitionMode::FifoAverage => {
                writes.push((registers::SEGMENT_SIZE, length));
                writes.push((registers::LOOPS, 0));
            }
        }
        writes.push((registers::POST_TRIGGER, self.post_trigger() as i64));
        if self.mode.is_averaging() {
            writes.push((registers::AVERAGES, i64::from(self.number_of_averages)));
        }
        writes.push((registers::CARD_MODE, self.mode.register_value()));
        let ts_mode = if self.timestamping {
            timestamp::MODE_STANDARD
        } else {
            timestamp::MODE_DISABLE
        };
        writes.push((registers::TIMESTAMP_COMMAND, ts_mode));
        writes
    }
}
