// src/device/card.rs
//! State and register access shared by every card kind

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::pulse_generator::PulseGenerator;
use super::registry::DriverLease;
use super::DeviceState;
use crate::config::{limits, CoreConfig};
use crate::error::{CardError, CardResult, ConfigRule, IntoCardError};
use crate::hal::registers::{self, command, features};
use crate::hal::{
    CardKind, CardStatus, DeviceAddress, Driver, FaultCode, HardwareProfile, Register, RegisterInterface,
};
use crate::settings::{IoLineMode, RegisterWrite};

/// One open card: handle, profile and lifecycle state
pub struct CardCore {
    address: DeviceAddress,
    io: Arc<dyn RegisterInterface>,
    profile: HardwareProfile,
    state: DeviceState,
    config: CoreConfig,
    lease: Option<DriverLease>,
}

impl CardCore {
    /// Claim and open the card at `address` and read its profile
    pub fn connect(driver: &dyn Driver, address: &DeviceAddress, config: CoreConfig) -> CardResult<Self> {
        let lease = DriverLease::acquire(address)?;
        let io = driver.open(address).map_err(|code| match code {
            FaultCode::BOARD_IN_USE => CardError::DeviceInUse {
                address: address.to_string(),
            },
            other => CardError::Connection {
                address: address.to_string(),
                reason: other.to_string(),
            },
        })?;
        let profile = match HardwareProfile::read(io.as_ref()) {
            Ok(profile) => profile,
            Err(code) => {
                io.close();
                return Err(CardError::from_fault(code, "read hardware profile"));
            }
        };
        info!(
            %address,
            kind = ?profile.kind,
            channels = profile.num_channels(),
            serial = profile.serial_number,
            "card connected"
        );
        Ok(Self {
            address: address.clone(),
            io,
            profile,
            state: DeviceState::Idle,
            config,
            lease: Some(lease),
        })
    }

    /// Fail unless the card is of `kind`; the handle is released on failure
    pub fn expect_kind(mut self, kind: CardKind) -> CardResult<Self> {
        if self.profile.kind == kind {
            return Ok(self);
        }
        let found = self.profile.kind;
        self.disconnect()?;
        Err(CardError::Connection {
            address: self.address.to_string(),
            reason: format!("expected {:?} card, found {:?}", kind, found),
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn io(&self) -> &dyn RegisterInterface {
        self.io.as_ref()
    }

    /// Shared handle, for sub-resources with their own lifecycle
    pub fn shared_io(&self) -> Arc<dyn RegisterInterface> {
        Arc::clone(&self.io)
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        if state != self.state {
            debug!(address = %self.address, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    /// Fail with `InvalidState` unless the current state is one of `allowed`
    pub fn require_state(&self, operation: &'static str, allowed: &[DeviceState]) -> CardResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CardError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    pub fn read(&self, register: Register) -> CardResult<i64> {
        let value = self.io.read(register).on_register(register)?;
        trace!(address = %self.address, %register, value, "read");
        Ok(value)
    }

    pub fn write(&self, register: Register, value: i64) -> CardResult<()> {
        trace!(address = %self.address, %register, value, "write");
        self.io.write(register, value).on_register(register)
    }

    /// Apply writes in order, stopping at the first fault
    pub fn apply(&self, writes: &[RegisterWrite]) -> CardResult<()> {
        writes.iter().try_for_each(|&(register, value)| self.write(register, value))
    }

    /// Issue a command word; wait commands block until done or timed out
    pub fn command(&self, bits: i64, operation: &str) -> CardResult<()> {
        trace!(address = %self.address, command = format_args!("{bits:#x}"), operation, "command");
        self.io.write(registers::CARD_COMMAND, bits).during(operation)
    }

    pub fn status(&self) -> CardResult<CardStatus> {
        let bits = self.read(registers::CARD_STATUS)?;
        Ok(CardStatus(bits as u32))
    }

    /// Reset the card to power-on settings; the card returns to Idle
    pub fn reset(&mut self) -> CardResult<()> {
        self.require_connected("reset")?;
        self.command(command::CARD_RESET, "reset")?;
        self.set_state(DeviceState::Idle);
        Ok(())
    }

    /// Software trigger event
    pub fn force_trigger(&self) -> CardResult<()> {
        self.require_state("force_trigger", &[DeviceState::Running])?;
        self.command(command::FORCE_TRIGGER, "force trigger")
    }

    /// Issue stop without a state change; faults are logged, not returned
    pub(crate) fn stop_quietly(&self) {
        if let Err(err) = self.command(command::CARD_STOP | command::DATA_STOP_DMA, "stop") {
            warn!(address = %self.address, %err, "fault while stopping");
        }
    }

    fn require_connected(&self, operation: &'static str) -> CardResult<()> {
        if self.state == DeviceState::Disconnected {
            return Err(CardError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Fail unless `channel` exists on the card
    pub fn check_channel(&self, channel: u8) -> CardResult<usize> {
        let channel = usize::from(channel);
        if channel < self.profile.num_channels() {
            Ok(channel)
        } else {
            Err(CardError::config(
                ConfigRule::ChannelNotPresent,
                format!("channel {} not on a {}-channel card", channel, self.profile.num_channels()),
            ))
        }
    }

    fn check_io_line(&self, line: u8) -> CardResult<usize> {
        if !self.profile.has_feature(features::BASE_XIO) {
            return Err(CardError::config(ConfigRule::FeatureNotSupported, "card has no multi-purpose I/O lines"));
        }
        let line = usize::from(line);
        if line < limits::IO_LINES {
            Ok(line)
        } else {
            Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("I/O line {} does not exist", line),
            ))
        }
    }

    /// Modes the card offers on `line`
    pub fn available_io_line_modes(&self, line: u8) -> CardResult<Vec<IoLineMode>> {
        let line = self.check_io_line(line)?;
        let bitmap = self.read(registers::XIO_AVAIL_MODES.at(line))?;
        Ok(IoLineMode::decode_available(bitmap))
    }

    pub fn io_line_mode(&self, line: u8) -> CardResult<IoLineMode> {
        let index = self.check_io_line(line)?;
        let value = self.read(registers::XIO_MODE.at(index))?;
        IoLineMode::from_register(value).ok_or_else(|| {
            CardError::from_fault(FaultCode::VALUE, format!("{}", registers::XIO_MODE.at(index)))
        })
    }

    /// Set the function of a multi-purpose line
    pub fn set_io_line_mode(&self, line: u8, mode: IoLineMode) -> CardResult<()> {
        self.require_connected("set_io_line_mode")?;
        if !self.available_io_line_modes(line)?.contains(&mode) {
            return Err(CardError::config(
                ConfigRule::FeatureNotSupported,
                format!("I/O line {} does not offer {:?}", line, mode),
            ));
        }
        let index = usize::from(line);
        self.write(registers::XIO_MODE.at(index), mode.register_value())?;
        self.command(command::WRITE_SETUP, "write setup")
    }

    /// Pulse generator attached to I/O line `index`
    pub fn pulse_generator(&self, index: u8) -> CardResult<PulseGenerator> {
        self.require_connected("pulse_generator")?;
        PulseGenerator::new(self.shared_io(), &self.profile, index)
    }

    /// Stop if running, release the handle and the address claim
    pub fn disconnect(&mut self) -> CardResult<()> {
        if self.state == DeviceState::Disconnected {
            return Ok(());
        }
        if self.state == DeviceState::Running {
            self.stop_quietly();
        }
        self.io.close();
        self.lease = None;
        self.set_state(DeviceState::Disconnected);
        info!(address = %self.address, "card disconnected");
        Ok(())
    }
}

impl Drop for CardCore {
    fn drop(&mut self) {
        if self.state != DeviceState::Disconnected {
            let _ = self.disconnect();
        }
    }
}

impl std::fmt::Debug for CardCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardCore")
            .field("address", &self.address)
            .field("kind", &self.profile.kind)
            .field("state", &self.state)
            .finish()
    }
}
