// src/settings/io_line.rs

use serde::{Deserialize, Serialize};

use crate::hal::registers::xio_mode;

/// Function of a multi-purpose I/O line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IoLineMode {
    /// Line unused
    #[default]
    Disabled,
    /// Asynchronous digital input
    AsyncIn,
    /// Asynchronous digital output
    AsyncOut,
    /// Additional trigger input
    TriggerIn,
    /// Trigger output
    TriggerOut,
    /// High while the card runs
    RunState,
    /// High while the card waits for a trigger
    ArmState,
    /// Driven by the line's pulse generator
    PulseGenerator,
}

impl IoLineMode {
    /// Every mode, in register bit order
    pub const ALL: [IoLineMode; 8] = [
        IoLineMode::Disabled,
        IoLineMode::AsyncIn,
        IoLineMode::AsyncOut,
        IoLineMode::TriggerIn,
        IoLineMode::TriggerOut,
        IoLineMode::RunState,
        IoLineMode::ArmState,
        IoLineMode::PulseGenerator,
    ];

    /// Mode register value
    pub fn register_value(self) -> i64 {
        match self {
            IoLineMode::Disabled => xio_mode::DISABLE,
            IoLineMode::AsyncIn => xio_mode::ASYNC_IN,
            IoLineMode::AsyncOut => xio_mode::ASYNC_OUT,
            IoLineMode::TriggerIn => xio_mode::TRIGGER_IN,
            IoLineMode::TriggerOut => xio_mode::TRIGGER_OUT,
            IoLineMode::RunState => xio_mode::RUN_STATE,
            IoLineMode::ArmState => xio_mode::ARM_STATE,
            IoLineMode::PulseGenerator => xio_mode::PULSE_GENERATOR,
        }
    }

    /// Decode a mode register value
    pub fn from_register(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.register_value() == value)
    }

    /// Decode the available-modes bitmap of a line
    pub fn decode_available(bitmap: i64) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|m| *m == IoLineMode::Disabled || bitmap & m.register_value() != 0)
            .collect()
    }
}
