// src/hal/traits.rs
//! Traits at the driver boundary

use std::sync::Arc;

use crate::hal::registers::Register;
use crate::hal::types::{BufferKind, DeviceAddress, HalResult, TransferDefinition};

/// Register-level transport to one open card
///
/// Writing a wait command to the command register blocks the calling thread
/// inside the driver until the awaited condition occurs or the card timeout
/// elapses.
pub trait RegisterInterface: Send + Sync {
    /// Read a 32- or 64-bit register
    fn read(&self, register: Register) -> HalResult<i64>;

    /// Write a 32- or 64-bit register
    fn write(&self, register: Register, value: i64) -> HalResult<()>;

    /// Bind host memory to a card stream
    fn define_transfer(&self, definition: TransferDefinition) -> HalResult<()>;

    /// Unbind the host memory of a card stream
    fn invalidate_transfer(&self, kind: BufferKind) -> HalResult<()>;

    /// Release the handle; later calls fail with an invalid-handle fault
    fn close(&self);
}

/// Opens handles to cards
pub trait Driver: Send + Sync {
    /// Open a card by address
    fn open(&self, address: &DeviceAddress) -> HalResult<Arc<dyn RegisterInterface>>;
}

/// Produces blocks of simulated samples
pub trait WaveformSource: Send {
    /// Interleaved block of `num_samples` per channel across `num_channels`
    fn next_block(&mut self, num_samples: usize, num_channels: usize) -> Vec<i16>;
}
