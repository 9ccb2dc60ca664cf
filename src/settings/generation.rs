// src/settings/generation.rs
//! AWG generation settings

use serde::{Deserialize, Serialize};

use super::{channel_mask, check_array_length, validate_channels, CardSettings, ClockMode, RegisterWrite};
use crate::config::streaming;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, card_mode, stop_level};
use crate::hal::HardwareProfile;

/// Replay mode of an AWG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GenerationMode {
    /// Waveform replayed from on-board memory after one trigger
    #[default]
    StandardSingle,
    /// Each replay waits for its own trigger
    StandardSingleRestart,
    /// Waveform blocks streamed from the host
    FifoSingle,
}

impl GenerationMode {
    /// Streaming mode
    pub fn is_fifo(self) -> bool {
        self == GenerationMode::FifoSingle
    }

    /// Card mode register value
    pub fn register_value(self) -> i64 {
        match self {
            GenerationMode::StandardSingle => card_mode::REP_STD_SINGLE,
            GenerationMode::StandardSingleRestart => card_mode::REP_STD_SINGLE_RESTART,
            GenerationMode::FifoSingle => card_mode::REP_FIFO_SINGLE,
        }
    }
}

/// Output filter of an AWG channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFilter {
    /// Full bandwidth
    #[default]
    None,
    /// Low-pass filter bank entry
    LowPass(u8),
}

impl OutputFilter {
    /// Filter register value
    pub fn register_value(self) -> i64 {
        match self {
            OutputFilter::None => 0,
            OutputFilter::LowPass(index) => i64::from(index) + 1,
        }
    }
}

/// Output level held while the AWG is not replaying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StopLevel {
    /// 0 V
    #[default]
    Zero,
    /// Most negative output
    Low,
    /// Most positive output
    High,
    /// Last replayed sample
    HoldLast,
    /// Channel's custom stop level
    Custom,
    /// High impedance
    Tristate,
}

impl StopLevel {
    /// Stop level register value
    pub fn register_value(self) -> i64 {
        match self {
            StopLevel::Zero => stop_level::ZERO,
            StopLevel::Low => stop_level::LOW,
            StopLevel::High => stop_level::HIGH,
            StopLevel::HoldLast => stop_level::HOLD_LAST,
            StopLevel::Custom => stop_level::CUSTOM,
            StopLevel::Tristate => stop_level::TRISTATE,
        }
    }
}

/// Everything `configure` needs for an AWG run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub mode: GenerationMode,
    /// Raw samples replayed on every enabled channel
    pub waveform: Vec<i16>,
    pub sample_rate_hz: u64,
    /// Replays, 0 replays until stopped
    pub num_loops: u64,
    pub enabled_channels: Vec<u8>,
    pub amplitudes_mv: Vec<u32>,
    pub dc_offsets_mv: Vec<i32>,
    #[serde(default)]
    pub output_filters: Vec<OutputFilter>,
    #[serde(default)]
    pub stop_levels: Vec<StopLevel>,
    /// Raw levels for channels using [`StopLevel::Custom`]
    #[serde(default)]
    pub custom_stop_levels: Option<Vec<i16>>,
    pub timeout_ms: u32,
    #[serde(default)]
    pub clock: ClockMode,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            mode: GenerationMode::StandardSingle,
            waveform: Vec::new(),
            sample_rate_hz: 1_000_000,
            num_loops: 1,
            enabled_channels: vec![0],
            amplitudes_mv: vec![1000],
            dc_offsets_mv: vec![0],
            output_filters: vec![OutputFilter::None],
            stop_levels: vec![StopLevel::Zero],
            custom_stop_levels: None,
            timeout_ms: streaming::DEFAULT_TIMEOUT_MS,
            clock: ClockMode::InternalPll,
        }
    }
}

impl GenerationSettings {
    /// Replay `waveform` `num_loops` times on `channels` with default levels
    pub fn new(waveform: Vec<i16>, sample_rate_hz: u64, num_loops: u64, channels: &[u8]) -> Self {
        Self {
            waveform,
            sample_rate_hz,
            num_loops,
            ..Self::default()
        }
        .with_channels(channels)
    }

    /// Enable `channels` with 1 V amplitude, no offset, no filter, zero stop level
    pub fn with_channels(mut self, channels: &[u8]) -> Self {
        let n = channels.len();
        self.enabled_channels = channels.to_vec();
        self.amplitudes_mv = vec![1000; n];
        self.dc_offsets_mv = vec![0; n];
        self.output_filters = vec![OutputFilter::None; n];
        self.stop_levels = vec![StopLevel::Zero; n];
        self.custom_stop_levels = None;
        self
    }

    /// Samples of one replay across all enabled channels
    pub fn frame_samples(&self) -> usize {
        self.waveform.len() * self.enabled_channels.len()
    }

    /// Waveform interleaved across the enabled channels
    pub fn interleaved_waveform(&self) -> Vec<i16> {
        let channels = self.enabled_channels.len();
        self.waveform
            .iter()
            .flat_map(|&sample| std::iter::repeat(sample).take(channels))
            .collect()
    }
}

impl CardSettings for GenerationSettings {
    fn clock(&self) -> ClockMode {
        self.clock
    }

    fn validate(&self, profile: &HardwareProfile) -> CardResult<()> {
        validate_channels(&self.enabled_channels, profile)?;
        let channels = self.enabled_channels.len();
        check_array_length("amplitudes_mv", self.amplitudes_mv.len(), channels)?;
        check_array_length("dc_offsets_mv", self.dc_offsets_mv.len(), channels)?;
        check_array_length("output_filters", self.output_filters.len(), channels)?;
        check_array_length("stop_levels", self.stop_levels.len(), channels)?;
        if self.stop_levels.contains(&StopLevel::Custom) {
            let custom = self.custom_stop_levels.as_ref().map_or(0, Vec::len);
            check_array_length("custom_stop_levels", custom, channels)?;
        }

        if self.sample_rate_hz == 0 {
            return Err(CardError::config(ConfigRule::ValueOutOfRange, "sample rate must be non-zero"));
        }
        let step = profile.memory_step.max(1) as usize;
        if self.waveform.is_empty() || self.waveform.len() % step != 0 {
            return Err(CardError::config(
                ConfigRule::WaveformLength,
                format!(
                    "waveform of {} samples must be a non-zero multiple of {}",
                    self.waveform.len(),
                    step
                ),
            ));
        }
        Ok(())
    }

    fn register_writes(&self, _profile: &HardwareProfile) -> Vec<RegisterWrite> {
        let mut writes = vec![(registers::CHANNEL_ENABLE, channel_mask(&self.enabled_channels))];
        for (i, &channel) in self.enabled_channels.iter().enumerate() {
            let channel = usize::from(channel);
            writes.push((registers::OUTPUT_ENABLE.at(channel), 1));
            writes.push((registers::AMPLITUDE.at(channel), i64::from(self.amplitudes_mv[i])));
            writes.push((registers::OFFSET.at(channel), i64::from(self.dc_offsets_mv[i])));
            writes.push((registers::FILTER.at(channel), self.output_filters[i].register_value()));
            writes.push((registers::STOP_LEVEL.at(channel), self.stop_levels[i].register_value()));
            if self.stop_levels[i] == StopLevel::Custom {
                if let Some(level) = self.custom_stop_levels.as_ref().and_then(|l| l.get(i)) {
                    writes.push((registers::CUSTOM_STOP.at(channel), i64::from(*level)));
                }
            }
        }
        writes.push((registers::SAMPLE_RATE, self.sample_rate_hz as i64));
        writes.push((registers::TIMEOUT, i64::from(self.timeout_ms)));
        writes.push((registers::MEMORY_SIZE, self.waveform.len() as i64));
        writes.push((registers::LOOPS, self.num_loops as i64));
        writes.push((registers::CARD_MODE, self.mode.register_value()));
        writes
    }
}
