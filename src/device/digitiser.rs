// src/device/digitiser.rs
//! Digitiser card: acquisition settings, single-shot and FIFO workflows

use tracing::{debug, warn};

use super::card::CardCore;
use super::{CancellationToken, Card, Configurable, DeviceState, Startable, Streamable};
use crate::acquisition::frames::split_segments;
use crate::acquisition::{BufferSpec, ChannelScaling, FrameAssembler, Measurement, Timestamper, TransferBuffer};
use crate::config::CoreConfig;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, command, features};
use crate::hal::{BufferDirection, BufferKind, CardKind, DeviceAddress, Driver};
use crate::settings::{
    to_register_writes, AcquisitionMode, AcquisitionSettings, InputImpedance, RegisterWrite, TriggerSettings,
};

const CONFIGURABLE: &[DeviceState] = &[DeviceState::Idle, DeviceState::Configured, DeviceState::Stopped];
const STARTABLE: &[DeviceState] = &[DeviceState::Configured, DeviceState::Stopped];

/// Analog input card
#[derive(Debug)]
pub struct Digitiser {
    core: CardCore,
    settings: Option<AcquisitionSettings>,
    trigger: TriggerSettings,
    buffer: Option<TransferBuffer>,
    requested_buffer: Option<BufferSpec>,
    timestamper: Option<Timestamper>,
    assembler: FrameAssembler,
    scaling: Vec<ChannelScaling>,
}

impl Digitiser {
    /// Open the digitiser at `address`
    pub fn connect(driver: &dyn Driver, address: &DeviceAddress, config: CoreConfig) -> CardResult<Self> {
        let core = CardCore::connect(driver, address, config)?.expect_kind(CardKind::Digitiser)?;
        Ok(Self {
            core,
            settings: None,
            trigger: TriggerSettings::none(),
            buffer: None,
            requested_buffer: None,
            timestamper: None,
            assembler: FrameAssembler::new(1),
            scaling: Vec::new(),
        })
    }

    /// Last applied settings
    pub fn settings(&self) -> Option<&AcquisitionSettings> {
        self.settings.as_ref()
    }

    /// Last applied trigger
    pub fn trigger(&self) -> &TriggerSettings {
        &self.trigger
    }

    /// Data buffer currently bound, if any
    pub fn transfer_buffer(&self) -> Option<&TransferBuffer> {
        self.buffer.as_ref()
    }

    pub fn state(&self) -> DeviceState {
        self.core.state()
    }

    fn configured(&self, operation: &'static str) -> CardResult<&AcquisitionSettings> {
        self.settings.as_ref().ok_or_else(|| CardError::InvalidState {
            operation,
            state: self.core.state().to_string(),
        })
    }

    fn require_mode(&self, operation: &'static str, allowed: fn(AcquisitionMode) -> bool) -> CardResult<()> {
        let settings = self.configured(operation)?;
        if allowed(settings.mode) {
            Ok(())
        } else {
            Err(CardError::InvalidState {
                operation,
                state: format!("configured for {:?}", settings.mode),
            })
        }
    }

    /// Use `spec` instead of the default streaming buffer
    pub fn define_transfer_buffer(&mut self, spec: BufferSpec) -> CardResult<()> {
        self.core.require_state("define_transfer_buffer", CONFIGURABLE)?;
        if spec.kind != BufferKind::Data || spec.direction != BufferDirection::CardToHost {
            return Err(CardError::config(
                ConfigRule::TransferDirection,
                "a digitiser data buffer transfers card to host",
            ));
        }
        spec.validate()?;
        self.requested_buffer = Some(spec);
        if self.settings.as_ref().is_some_and(|s| s.mode.is_fifo()) {
            self.arm_streaming_buffer()?;
        }
        Ok(())
    }

    fn streaming_spec(&self, settings: &AcquisitionSettings) -> BufferSpec {
        self.requested_buffer.unwrap_or_else(|| {
            BufferSpec::streaming(
                BufferDirection::CardToHost,
                settings.frame_samples() * self.core.profile().bytes_per_sample,
                &self.core.config().transfer,
            )
        })
    }

    // Write the derived registers, then rebuild scaling, buffers and timestamps
    fn apply_settings(
        &mut self,
        settings: AcquisitionSettings,
        trigger: &TriggerSettings,
        writes: &[RegisterWrite],
    ) -> CardResult<()> {
        self.core.apply(writes)?;

        let max_adc = self.core.profile().max_adc_value;
        self.scaling = settings
            .vertical_ranges_mv
            .iter()
            .zip(&settings.vertical_offsets_percent)
            .map(|(&range_mv, &offset_percent)| ChannelScaling {
                range_mv,
                offset_percent,
                max_adc,
            })
            .collect();
        self.assembler = FrameAssembler::new(settings.frame_samples());
        self.trigger = trigger.clone();
        let streaming = settings.mode.is_fifo();
        self.settings = Some(settings);
        if streaming {
            self.arm_streaming_buffer()?;
        }
        self.enable_timestamps()
    }

    // Fresh ring bound to the card; a rebind resets the driver's cursors
    fn arm_streaming_buffer(&mut self) -> CardResult<()> {
        let settings = self.configured("arm buffer")?;
        let spec = self.streaming_spec(settings);
        let buffer = TransferBuffer::allocate(spec)?;
        buffer.attach(self.core.io())?;
        self.buffer = Some(buffer);
        self.assembler.clear();
        Ok(())
    }

    fn enable_timestamps(&mut self) -> CardResult<()> {
        self.release_timestamps();
        let Some(settings) = self.settings.as_ref() else {
            return Ok(());
        };
        self.timestamper = if settings.timestamping {
            Some(Timestamper::enable(
                self.core.io(),
                settings.sample_rate_hz,
                self.trigger.is_software_only(),
                &self.core.config().timestamps,
            )?)
        } else {
            None
        };
        Ok(())
    }

    // Unbind the timestamp stream; faults are logged since the stream is being dropped
    fn release_timestamps(&mut self) {
        if let Some(timestamper) = self.timestamper.take() {
            if let Err(err) = timestamper.disable(self.core.io()) {
                warn!(address = %self.core.address(), %err, "fault releasing timestamp stream");
            }
        }
    }

    fn next_timestamp(&mut self) -> CardResult<Option<chrono::DateTime<chrono::Utc>>> {
        match self.timestamper.as_mut() {
            Some(timestamper) => Ok(Some(timestamper.next_timestamp(self.core.io())?)),
            None => Ok(None),
        }
    }

    /// Start, wait for the record, transfer it and stop
    ///
    /// On timeout the card is left running so the caller may wait again or stop.
    pub fn execute_standard_single_acquisition(&mut self) -> CardResult<Measurement> {
        self.require_mode("execute_standard_single_acquisition", |m| {
            m == AcquisitionMode::StandardSingle
        })?;
        self.start()?;
        self.wait_for_acquisition_to_complete()?;
        let measurement = self.retrieve_standard_single_measurement()?;
        self.stop()?;
        Ok(measurement)
    }

    /// Start, wait for every segment, transfer the record and stop
    pub fn execute_standard_multi_acquisition(&mut self) -> CardResult<Vec<Measurement>> {
        self.require_mode("execute_standard_multi_acquisition", |m| {
            m.is_segmented() && !m.is_fifo()
        })?;
        self.start()?;
        self.wait_for_acquisition_to_complete()?;
        let record = self.transfer_record()?;
        let frame_samples = self.assembler.frame_samples();
        let mut measurements = Vec::new();
        for segment in split_segments(&record, frame_samples) {
            let timestamp = self.next_timestamp()?;
            measurements.push(Measurement::from_raw_frame(&segment, &self.scaling, timestamp));
        }
        self.stop()?;
        Ok(measurements)
    }

    /// Block until the card reports the run complete, bounded by its timeout
    pub fn wait_for_acquisition_to_complete(&mut self) -> CardResult<()> {
        self.core.require_state("wait_for_acquisition_to_complete", &[DeviceState::Running])?;
        self.core.command(command::WAIT_READY, "wait for acquisition")
    }

    /// Transfer a completed single-shot record
    pub fn retrieve_standard_single_measurement(&mut self) -> CardResult<Measurement> {
        self.require_mode("retrieve_standard_single_measurement", |m| {
            m == AcquisitionMode::StandardSingle
        })?;
        let record = self.transfer_record()?;
        let timestamp = self.next_timestamp()?;
        Ok(Measurement::from_raw_frame(&record, &self.scaling, timestamp))
    }

    // One bulk transfer of the whole on-board record
    fn transfer_record(&mut self) -> CardResult<Vec<i16>> {
        self.core
            .require_state("retrieve record", &[DeviceState::Running, DeviceState::Stopped])?;
        let settings = self.configured("retrieve record")?;
        let bytes = settings.memory_samples() as usize
            * settings.enabled_channels.len()
            * self.core.profile().bytes_per_sample;
        let buffer = TransferBuffer::allocate(BufferSpec::single_transfer(
            BufferKind::Data,
            BufferDirection::CardToHost,
            bytes,
        ))?;
        buffer.attach(self.core.io())?;
        self.core
            .command(command::DATA_START_DMA | command::DATA_WAIT_DMA, "record transfer")?;
        let record = buffer.contents();
        debug!(address = %self.core.address(), samples = record.len(), "record transferred");
        self.buffer = Some(buffer);
        Ok(record)
    }

    // Next whole frame from the stream, waiting for notify chunks as needed
    fn next_frame(&mut self, cancel: &CancellationToken) -> CardResult<Measurement> {
        loop {
            if let Some(frame) = self.assembler.pop_frame() {
                let timestamp = self.next_timestamp()?;
                return Ok(Measurement::from_raw_frame(&frame, &self.scaling, timestamp));
            }
            if cancel.is_cancelled() {
                return Err(CardError::Cancelled);
            }
            let io = self.core.io();
            let buffer = self.buffer.as_mut().ok_or_else(|| CardError::InvalidState {
                operation: "next_measurements",
                state: "no transfer buffer".to_string(),
            })?;
            let chunk = buffer.advance_after_notify(io)?;
            buffer.release_consumed(io)?;
            self.assembler.push(&chunk);
        }
    }

    /// Set the input range of one channel immediately
    pub fn set_vertical_range(&mut self, channel: u8, range_mv: u32) -> CardResult<()> {
        self.core.require_state("set_vertical_range", CONFIGURABLE)?;
        let index = self.core.check_channel(channel)?;
        self.core.write(registers::AMPLITUDE.at(index), i64::from(range_mv))?;
        if let Some(position) = self.enabled_position(channel) {
            if let Some(settings) = self.settings.as_mut() {
                settings.vertical_ranges_mv[position] = range_mv;
            }
            self.scaling[position].range_mv = range_mv;
        }
        Ok(())
    }

    /// Set the offset of one channel, percent of its range
    pub fn set_vertical_offset(&mut self, channel: u8, offset_percent: i32) -> CardResult<()> {
        self.core.require_state("set_vertical_offset", CONFIGURABLE)?;
        let index = self.core.check_channel(channel)?;
        if offset_percent.abs() > 100 {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("vertical offset {}% outside ±100%", offset_percent),
            ));
        }
        self.core.write(registers::OFFSET.at(index), i64::from(offset_percent))?;
        if let Some(position) = self.enabled_position(channel) {
            if let Some(settings) = self.settings.as_mut() {
                settings.vertical_offsets_percent[position] = offset_percent;
            }
            self.scaling[position].offset_percent = offset_percent;
        }
        Ok(())
    }

    pub fn set_input_impedance(&mut self, channel: u8, impedance: InputImpedance) -> CardResult<()> {
        self.core.require_state("set_input_impedance", CONFIGURABLE)?;
        let index = self.core.check_channel(channel)?;
        self.core.write(
            registers::IMPEDANCE_50_OHM.at(index),
            i64::from(impedance == InputImpedance::FiftyOhm),
        )?;
        if let Some(position) = self.enabled_position(channel) {
            if let Some(settings) = self.settings.as_mut() {
                settings.input_impedances[position] = impedance;
            }
        }
        Ok(())
    }

    /// Range in mV as held by the card
    pub fn vertical_range(&self, channel: u8) -> CardResult<u32> {
        let index = self.core.check_channel(channel)?;
        Ok(self.core.read(registers::AMPLITUDE.at(index))?.max(0) as u32)
    }

    fn enabled_position(&self, channel: u8) -> Option<usize> {
        self.settings
            .as_ref()
            .and_then(|s| s.enabled_channels.iter().position(|&c| c == channel))
    }
}

impl Card for Digitiser {
    fn core(&self) -> &CardCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CardCore {
        &mut self.core
    }

    fn disconnect(&mut self) -> CardResult<()> {
        self.release_timestamps();
        self.buffer = None;
        self.core.disconnect()
    }
}

impl Configurable for Digitiser {
    type Settings = AcquisitionSettings;

    fn validate_settings(&self, settings: &AcquisitionSettings, trigger: &TriggerSettings) -> CardResult<()> {
        let settings = settings.coerced_to_fifo_step(self.core.config().streaming.fifo_step_samples);
        to_register_writes(&settings, trigger, self.core.profile())?;
        if settings.timestamping && !self.core.profile().has_feature(features::TIMESTAMP) {
            return Err(CardError::config(ConfigRule::FeatureNotSupported, "card has no timestamp option"));
        }
        if settings.mode.is_fifo() {
            self.streaming_spec(&settings).validate()?;
        }
        Ok(())
    }

    fn configure(&mut self, settings: &AcquisitionSettings, trigger: &TriggerSettings) -> CardResult<()> {
        self.core.require_state("configure", CONFIGURABLE)?;
        self.validate_settings(settings, trigger)?;
        let settings = settings.coerced_to_fifo_step(self.core.config().streaming.fifo_step_samples);
        let writes = to_register_writes(&settings, trigger, self.core.profile())?;
        self.release_timestamps();
        self.buffer = None;
        if let Err(err) = self.apply_settings(settings, trigger, &writes) {
            // Registers now hold part of the new settings
            self.settings = None;
            self.release_timestamps();
            self.buffer = None;
            self.core.set_state(DeviceState::Idle);
            return Err(err);
        }
        self.core.set_state(DeviceState::Configured);
        debug!(address = %self.core.address(), writes = writes.len(), "digitiser configured");
        Ok(())
    }
}

impl Startable for Digitiser {
    fn state(&self) -> DeviceState {
        self.core.state()
    }

    fn start(&mut self) -> CardResult<()> {
        self.core.require_state("start", STARTABLE)?;
        let streaming = self.configured("start")?.mode.is_fifo();
        if self.core.state() == DeviceState::Stopped {
            if streaming {
                self.arm_streaming_buffer()?;
            }
            self.enable_timestamps()?;
        }
        let mut bits = command::CARD_START | command::ENABLE_TRIGGER;
        if streaming {
            bits |= command::DATA_START_DMA;
        }
        self.core.command(bits, "start")?;
        self.core.set_state(DeviceState::Running);
        Ok(())
    }

    fn stop(&mut self) -> CardResult<()> {
        self.core.require_state("stop", &[DeviceState::Running])?;
        self.core
            .command(command::CARD_STOP | command::DATA_STOP_DMA, "stop")?;
        if let Some(buffer) = self.buffer.as_mut() {
            if let Err(err) = buffer.release_consumed(self.core.io()) {
                warn!(address = %self.core.address(), %err, "fault releasing buffer after stop");
            }
        }
        self.core.set_state(DeviceState::Stopped);
        Ok(())
    }
}

impl Streamable for Digitiser {
    fn batch_size(&self) -> usize {
        self.settings.as_ref().map_or(1, |s| s.batch_size.max(1) as usize)
    }

    /// Stops the card before returning, also when a measurement fails
    fn execute_finite_fifo_acquisition(&mut self, count: usize) -> CardResult<Vec<Measurement>> {
        self.require_mode("execute_finite_fifo_acquisition", AcquisitionMode::is_fifo)?;
        let batch = self.batch_size();
        if count == 0 || count % batch != 0 {
            return Err(CardError::config(
                ConfigRule::BatchSize,
                format!("{} measurements is not a whole number of batches of {}", count, batch),
            ));
        }
        self.start()?;
        let cancel = CancellationToken::new();
        let mut measurements = Vec::with_capacity(count);
        while measurements.len() < count {
            match self.next_measurements(&cancel) {
                Ok(batch) => measurements.extend(batch),
                Err(err) => {
                    self.core.stop_quietly();
                    self.core.set_state(DeviceState::Stopped);
                    return Err(err);
                }
            }
        }
        self.stop()?;
        Ok(measurements)
    }

    fn execute_continuous_fifo_acquisition(&mut self) -> CardResult<()> {
        self.require_mode("execute_continuous_fifo_acquisition", AcquisitionMode::is_fifo)?;
        self.start()
    }

    fn next_measurements(&mut self, cancel: &CancellationToken) -> CardResult<Vec<Measurement>> {
        self.core.require_state("next_measurements", &[DeviceState::Running])?;
        self.require_mode("next_measurements", AcquisitionMode::is_fifo)?;
        (0..self.batch_size()).map(|_| self.next_frame(cancel)).collect()
    }
}
