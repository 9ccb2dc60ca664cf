// src/device/awg.rs
//! Arbitrary waveform generator card

use tracing::debug;

use super::card::CardCore;
use super::{CancellationToken, Card, Configurable, DeviceState, Startable};
use crate::acquisition::{BufferSpec, TransferBuffer};
use crate::config::CoreConfig;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, command};
use crate::hal::{BufferDirection, BufferKind, CardKind, DeviceAddress, Driver};
use crate::settings::{
    to_register_writes, GenerationMode, GenerationSettings, OutputFilter, StopLevel, TriggerSettings,
};

const CONFIGURABLE: &[DeviceState] = &[DeviceState::Idle, DeviceState::Configured, DeviceState::Stopped];
const STARTABLE: &[DeviceState] = &[DeviceState::Configured, DeviceState::Stopped];

/// Analog output card
#[derive(Debug)]
pub struct Awg {
    core: CardCore,
    settings: Option<GenerationSettings>,
    trigger: TriggerSettings,
    buffer: Option<TransferBuffer>,
    requested_buffer: Option<BufferSpec>,
}

impl Awg {
    /// Open the AWG at `address`
    pub fn connect(driver: &dyn Driver, address: &DeviceAddress, config: CoreConfig) -> CardResult<Self> {
        let core = CardCore::connect(driver, address, config)?.expect_kind(CardKind::Awg)?;
        Ok(Self {
            core,
            settings: None,
            trigger: TriggerSettings::none(),
            buffer: None,
            requested_buffer: None,
        })
    }

    pub fn settings(&self) -> Option<&GenerationSettings> {
        self.settings.as_ref()
    }

    pub fn trigger(&self) -> &TriggerSettings {
        &self.trigger
    }

    pub fn transfer_buffer(&self) -> Option<&TransferBuffer> {
        self.buffer.as_ref()
    }

    pub fn state(&self) -> DeviceState {
        self.core.state()
    }

    fn mode(&self, operation: &'static str) -> CardResult<GenerationMode> {
        self.settings.as_ref().map(|s| s.mode).ok_or_else(|| CardError::InvalidState {
            operation,
            state: self.core.state().to_string(),
        })
    }

    fn wrong_mode(operation: &'static str, mode: GenerationMode) -> CardError {
        CardError::InvalidState {
            operation,
            state: format!("configured for {:?}", mode),
        }
    }

    /// Use `spec` instead of the default streaming buffer for FIFO generation
    pub fn define_transfer_buffer(&mut self, spec: BufferSpec) -> CardResult<()> {
        self.core.require_state("define_transfer_buffer", CONFIGURABLE)?;
        if spec.kind != BufferKind::Data || spec.direction != BufferDirection::HostToCard {
            return Err(CardError::config(
                ConfigRule::TransferDirection,
                "an AWG data buffer transfers host to card",
            ));
        }
        spec.validate()?;
        self.requested_buffer = Some(spec);
        Ok(())
    }

    fn streaming_spec(&self, settings: &GenerationSettings) -> BufferSpec {
        self.requested_buffer.unwrap_or_else(|| {
            BufferSpec::streaming(
                BufferDirection::HostToCard,
                settings.frame_samples() * self.core.profile().bytes_per_sample,
                &self.core.config().transfer,
            )
        })
    }

    // Copy the whole waveform to on-board memory in one transfer
    fn load_waveform(&mut self, settings: &GenerationSettings) -> CardResult<()> {
        let samples = settings.interleaved_waveform();
        let mut buffer = TransferBuffer::allocate(BufferSpec::single_transfer(
            BufferKind::Data,
            BufferDirection::HostToCard,
            samples.len() * self.core.profile().bytes_per_sample,
        ))?;
        buffer.attach(self.core.io())?;
        buffer.preload(self.core.io(), &samples)?;
        self.core
            .command(command::DATA_START_DMA | command::DATA_WAIT_DMA, "waveform transfer")?;
        debug!(address = %self.core.address(), samples = samples.len(), "waveform loaded");
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Replay the loaded waveform; finite loop counts wait for the end and stop
    ///
    /// A timed-out wait leaves the card running.
    pub fn execute_standard_single_generation(&mut self) -> CardResult<()> {
        let mode = self.mode("execute_standard_single_generation")?;
        if mode.is_fifo() {
            return Err(Self::wrong_mode("execute_standard_single_generation", mode));
        }
        self.start()?;
        let loops = self.settings.as_ref().map_or(0, |s| s.num_loops);
        if loops > 0 {
            self.wait_for_generation_to_complete()?;
            self.stop()?;
        }
        Ok(())
    }

    /// Block until the card reports every loop replayed
    pub fn wait_for_generation_to_complete(&mut self) -> CardResult<()> {
        self.core.require_state("wait_for_generation_to_complete", &[DeviceState::Running])?;
        self.core.command(command::WAIT_READY, "wait for generation")
    }

    /// Stream `blocks` to the card and start replay once the buffer is primed
    ///
    /// Blocks are regrouped into notify-sized chunks; a short final chunk is
    /// padded with zeros. Returns the number of samples handed to the card.
    /// The card is left running; the caller stops it.
    pub fn execute_fifo_generation<I>(&mut self, blocks: I, cancel: &CancellationToken) -> CardResult<u64>
    where
        I: IntoIterator<Item = Vec<i16>>,
    {
        let mode = self.mode("execute_fifo_generation")?;
        if !mode.is_fifo() {
            return Err(Self::wrong_mode("execute_fifo_generation", mode));
        }
        self.core.require_state("execute_fifo_generation", STARTABLE)?;
        let spec = match self.settings.as_ref() {
            Some(settings) => self.streaming_spec(settings),
            None => return Err(Self::wrong_mode("execute_fifo_generation", mode)),
        };
        let mut buffer = TransferBuffer::allocate(spec)?;
        buffer.attach(self.core.io())?;
        let chunk_samples = spec.notify_bytes / self.core.profile().bytes_per_sample.max(1);
        let mut chunks = NotifyChunks::new(blocks.into_iter(), chunk_samples);
        let mut sent = 0u64;

        let mut next = chunks.next();
        while let Some(chunk) = next.as_ref() {
            if buffer.available_bytes() < spec.notify_bytes {
                break;
            }
            buffer.preload(self.core.io(), chunk)?;
            sent += chunk.len() as u64;
            next = chunks.next();
        }

        self.core.command(
            command::CARD_START | command::ENABLE_TRIGGER | command::DATA_START_DMA,
            "start",
        )?;
        self.core.set_state(DeviceState::Running);
        let io = self.core.io();
        while let Some(chunk) = next {
            if cancel.is_cancelled() {
                self.buffer = Some(buffer);
                return Err(CardError::Cancelled);
            }
            if let Err(err) = buffer.fill_after_notify(io, &chunk) {
                self.buffer = Some(buffer);
                return Err(err);
            }
            sent += chunk.len() as u64;
            next = chunks.next();
        }
        debug!(address = %self.core.address(), samples = sent, metrics = ?buffer.metrics(), "FIFO blocks delivered");
        self.buffer = Some(buffer);
        Ok(sent)
    }

    fn require_setter(&self, operation: &'static str, channel: u8) -> CardResult<usize> {
        self.core.require_state(operation, CONFIGURABLE)?;
        self.core.check_channel(channel)
    }

    fn enabled_position(&self, channel: u8) -> Option<usize> {
        self.settings
            .as_ref()
            .and_then(|s| s.enabled_channels.iter().position(|&c| c == channel))
    }

    fn update_settings(&mut self, channel: u8, update: impl FnOnce(&mut GenerationSettings, usize)) {
        if let Some(position) = self.enabled_position(channel) {
            if let Some(settings) = self.settings.as_mut() {
                update(settings, position);
            }
        }
    }

    pub fn set_amplitude(&mut self, channel: u8, amplitude_mv: u32) -> CardResult<()> {
        let index = self.require_setter("set_amplitude", channel)?;
        self.core.write(registers::AMPLITUDE.at(index), i64::from(amplitude_mv))?;
        self.update_settings(channel, |s, i| s.amplitudes_mv[i] = amplitude_mv);
        Ok(())
    }

    pub fn set_dc_offset(&mut self, channel: u8, offset_mv: i32) -> CardResult<()> {
        let index = self.require_setter("set_dc_offset", channel)?;
        self.core.write(registers::OFFSET.at(index), i64::from(offset_mv))?;
        self.update_settings(channel, |s, i| s.dc_offsets_mv[i] = offset_mv);
        Ok(())
    }

    pub fn set_output_filter(&mut self, channel: u8, filter: OutputFilter) -> CardResult<()> {
        let index = self.require_setter("set_output_filter", channel)?;
        self.core.write(registers::FILTER.at(index), filter.register_value())?;
        self.update_settings(channel, |s, i| s.output_filters[i] = filter);
        Ok(())
    }

    /// Level held while not replaying; `Custom` uses the level set by
    /// [`set_custom_stop_level`](Self::set_custom_stop_level)
    pub fn set_stop_level(&mut self, channel: u8, level: StopLevel) -> CardResult<()> {
        let index = self.require_setter("set_stop_level", channel)?;
        self.core.write(registers::STOP_LEVEL.at(index), level.register_value())?;
        self.update_settings(channel, |s, i| s.stop_levels[i] = level);
        Ok(())
    }

    pub fn set_custom_stop_level(&mut self, channel: u8, level: i16) -> CardResult<()> {
        let index = self.require_setter("set_custom_stop_level", channel)?;
        self.core.write(registers::CUSTOM_STOP.at(index), i64::from(level))?;
        self.update_settings(channel, |s, i| {
            let channels = s.enabled_channels.len();
            let levels = s.custom_stop_levels.get_or_insert_with(|| vec![0; channels]);
            levels[i] = level;
        });
        Ok(())
    }

    pub fn set_output_enabled(&mut self, channel: u8, enabled: bool) -> CardResult<()> {
        let index = self.require_setter("set_output_enabled", channel)?;
        self.core.write(registers::OUTPUT_ENABLE.at(index), i64::from(enabled))?;
        self.core.command(command::WRITE_SETUP, "write setup")
    }

    /// Output enable as held by the card
    pub fn output_enabled(&self, channel: u8) -> CardResult<bool> {
        let index = self.core.check_channel(channel)?;
        Ok(self.core.read(registers::OUTPUT_ENABLE.at(index))? != 0)
    }
}

// Regroups arbitrary blocks into fixed-size chunks, zero-padding the tail
struct NotifyChunks<I> {
    blocks: I,
    chunk_samples: usize,
    pending: Vec<i16>,
    exhausted: bool,
}

impl<I: Iterator<Item = Vec<i16>>> NotifyChunks<I> {
    fn new(blocks: I, chunk_samples: usize) -> Self {
        Self {
            blocks,
            chunk_samples: chunk_samples.max(1),
            pending: Vec::new(),
            exhausted: false,
        }
    }
}

impl<I: Iterator<Item = Vec<i16>>> Iterator for NotifyChunks<I> {
    type Item = Vec<i16>;

    fn next(&mut self) -> Option<Vec<i16>> {
        while !self.exhausted && self.pending.len() < self.chunk_samples {
            match self.blocks.next() {
                Some(block) => self.pending.extend(block),
                None => self.exhausted = true,
            }
        }
        if self.pending.is_empty() {
            return None;
        }
        if self.pending.len() >= self.chunk_samples {
            let rest = self.pending.split_off(self.chunk_samples);
            return Some(std::mem::replace(&mut self.pending, rest));
        }
        let mut tail = std::mem::take(&mut self.pending);
        tail.resize(self.chunk_samples, 0);
        Some(tail)
    }
}

impl Card for Awg {
    fn core(&self) -> &CardCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CardCore {
        &mut self.core
    }

    fn disconnect(&mut self) -> CardResult<()> {
        self.buffer = None;
        self.core.disconnect()
    }
}

impl Configurable for Awg {
    type Settings = GenerationSettings;

    fn validate_settings(&self, settings: &GenerationSettings, trigger: &TriggerSettings) -> CardResult<()> {
        to_register_writes(settings, trigger, self.core.profile())?;
        if settings.mode.is_fifo() {
            self.streaming_spec(settings).validate()?;
        }
        Ok(())
    }

    fn configure(&mut self, settings: &GenerationSettings, trigger: &TriggerSettings) -> CardResult<()> {
        self.core.require_state("configure", CONFIGURABLE)?;
        self.validate_settings(settings, trigger)?;
        let writes = to_register_writes(settings, trigger, self.core.profile())?;
        self.buffer = None;
        let applied = self.core.apply(&writes).and_then(|()| {
            if settings.mode.is_fifo() {
                Ok(())
            } else {
                self.load_waveform(settings)
            }
        });
        if let Err(err) = applied {
            // Registers now hold part of the new settings
            self.settings = None;
            self.buffer = None;
            self.core.set_state(DeviceState::Idle);
            return Err(err);
        }
        self.settings = Some(settings.clone());
        self.trigger = trigger.clone();
        self.core.set_state(DeviceState::Configured);
        debug!(address = %self.core.address(), writes = writes.len(), mode = ?settings.mode, "AWG configured");
        Ok(())
    }
}

impl Startable for Awg {
    fn state(&self) -> DeviceState {
        self.core.state()
    }

    /// Start replay of the loaded waveform; FIFO runs start through
    /// [`Awg::execute_fifo_generation`]
    fn start(&mut self) -> CardResult<()> {
        self.core.require_state("start", STARTABLE)?;
        let mode = self.mode("start")?;
        if mode.is_fifo() {
            return Err(Self::wrong_mode("start", mode));
        }
        self.core
            .command(command::CARD_START | command::ENABLE_TRIGGER, "start")?;
        self.core.set_state(DeviceState::Running);
        Ok(())
    }

    fn stop(&mut self) -> CardResult<()> {
        self.core.require_state("stop", &[DeviceState::Running])?;
        self.core
            .command(command::CARD_STOP | command::DATA_STOP_DMA, "stop")?;
        if let Some(buffer) = self.buffer.as_ref() {
            debug!(address = %self.core.address(), metrics = ?buffer.metrics(), "generation stopped");
        }
        self.core.set_state(DeviceState::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_regroup_and_pad() {
        let blocks = vec![vec![1; 3], vec![2; 4], vec![3; 2]];
        let chunks: Vec<_> = NotifyChunks::new(blocks.into_iter(), 4).collect();
        assert_eq!(chunks, vec![vec![1, 1, 1, 2], vec![2, 2, 2, 3], vec![3, 0, 0, 0]]);
    }

    #[test]
    fn test_chunks_of_empty_input() {
        let chunks: Vec<Vec<i16>> = NotifyChunks::new(std::iter::empty(), 8).collect();
        assert!(chunks.is_empty());
    }

    #[cfg(feature = "simulation")]
    mod simulated {
        use super::super::*;
        use crate::config::MockConfig;
        use crate::error::ErrorKind;
        use crate::hal::mock::MockDriver;
        use serial_test::serial;

        fn awg() -> (MockDriver, Awg) {
            let driver = MockDriver::new();
            let address = driver.add_awg(MockConfig {
                frame_rate_hz: 1000.0,
                ..MockConfig::default()
            });
            let awg = Awg::connect(&driver, &address, CoreConfig::default()).unwrap();
            (driver, awg)
        }

        #[test]
        #[serial]
        fn test_configure_loads_waveform_on_board() {
            let (driver, mut awg) = awg();
            let waveform: Vec<i16> = (0..64).collect();
            let settings = GenerationSettings::new(waveform.clone(), 1_000_000, 1, &[0]);
            awg.configure(&settings, &TriggerSettings::software()).unwrap();
            let card = driver.card(awg.core().address()).unwrap();
            assert_eq!(card.onboard_samples(), waveform);
            assert_eq!(awg.state(), DeviceState::Configured);
        }

        #[test]
        #[serial]
        fn test_finite_generation_stops() {
            let (_driver, mut awg) = awg();
            let settings = GenerationSettings::new(vec![100; 64], 1_000_000, 2, &[0, 1]);
            awg.configure(&settings, &TriggerSettings::software()).unwrap();
            awg.execute_standard_single_generation().unwrap();
            assert_eq!(awg.state(), DeviceState::Stopped);
        }

        #[test]
        #[serial]
        fn test_fifo_mode_rejects_plain_start() {
            let (_driver, mut awg) = awg();
            let settings = GenerationSettings {
                mode: GenerationMode::FifoSingle,
                ..GenerationSettings::new(vec![0; 64], 1_000_000, 0, &[0])
            };
            awg.configure(&settings, &TriggerSettings::software()).unwrap();
            assert_eq!(awg.start().unwrap_err().kind(), ErrorKind::InvalidState);
        }

        #[test]
        #[serial]
        fn test_stop_level_setter() {
            let (driver, mut awg) = awg();
            awg.set_stop_level(2, StopLevel::HoldLast).unwrap();
            let card = driver.card(awg.core().address()).unwrap();
            assert_eq!(card.peek(registers::STOP_LEVEL.at(2)), StopLevel::HoldLast.register_value());
        }
    }
}
