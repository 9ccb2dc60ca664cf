// src/hal/types.rs
//! Common types shared by the register interface and its backends

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::error_codes;

/// Result type used at the register-interface boundary
pub type HalResult<T> = Result<T, FaultCode>;

/// Numeric fault code reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaultCode(pub u32);

#[allow(missing_docs)]
impl FaultCode {
    pub const OK: Self = Self(0x0000);
    pub const INIT: Self = Self(0x0001);
    pub const TYPE: Self = Self(0x0003);
    pub const FUNCTION_NOT_SUPPORTED: Self = Self(0x0004);
    pub const INVALID_HANDLE: Self = Self(0x0009);
    pub const BOARD_NOT_FOUND: Self = Self(0x000A);
    pub const BOARD_IN_USE: Self = Self(0x000B);
    pub const LAST_ERROR: Self = Self(0x0010);
    pub const ABORT: Self = Self(0x0020);
    pub const BOARD_LOCKED: Self = Self(0x0030);
    pub const NETWORK_SETUP: Self = Self(0x0040);
    pub const NETWORK_TIMEOUT: Self = Self(0x0043);
    pub const BUFFER_SIZE: Self = Self(0x0044);
    pub const INVALID_PARAMETER: Self = Self(0x0046);
    pub const TEMPERATURE: Self = Self(0x0047);
    pub const REGISTER: Self = Self(0x0100);
    pub const VALUE: Self = Self(0x0101);
    pub const FEATURE: Self = Self(0x0102);
    pub const SEQUENCE: Self = Self(0x0103);
    pub const READ_ABORT: Self = Self(0x0104);
    pub const NO_ACCESS: Self = Self(0x0105);
    pub const TIMEOUT: Self = Self(0x0107);
    pub const NO_WRITE_ALLOWED: Self = Self(0x010A);
    pub const SETUP: Self = Self(0x010B);
    pub const CLOCK_NOT_LOCKED: Self = Self(0x010C);
    pub const CHANNEL: Self = Self(0x0110);
    pub const NOTIFY_SIZE: Self = Self(0x0111);
    pub const RUNNING: Self = Self(0x0120);
    pub const PRETRIGGER_LENGTH: Self = Self(0x0140);
    pub const DIRECTION_MISMATCH: Self = Self(0x0141);
    pub const POST_EXCEEDS_SEGMENT: Self = Self(0x0142);
    pub const SEGMENT_IN_MEMORY: Self = Self(0x0143);
    pub const AND_OR_MASK_OVERLAP: Self = Self(0x0146);
    pub const AND_MASK_EDGE: Self = Self(0x0147);
    pub const OR_MASK_LEVEL: Self = Self(0x0148);
    pub const EDGE_PER_MODULE: Self = Self(0x0149);
    pub const STARHUB_ENABLE: Self = Self(0x014B);
    pub const DMA_LOCKED: Self = Self(0x0204);
    pub const MEMORY_ALLOCATION: Self = Self(0x0205);
    pub const FIFO_BUFFER_OVERRUN: Self = Self(0x0300);
    pub const FIFO_HW_OVERRUN: Self = Self(0x0301);
    pub const FIFO_FINISHED: Self = Self(0x0302);
    pub const FIFO_SETUP: Self = Self(0x0309);
    pub const TIMESTAMP_SYNC: Self = Self(0x0310);
    pub const STARHUB: Self = Self(0x0320);
    pub const INTERNAL: Self = Self(0xFFFF);
}

impl FaultCode {
    /// Raw numeric value
    pub fn value(self) -> u32 {
        self.0
    }

    /// True for the success code
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Category from the static fault table
    pub fn category(self) -> FaultCategory {
        error_codes::describe(self).0
    }

    /// Human-readable message from the static fault table
    pub fn message(self) -> &'static str {
        error_codes::describe(self).1
    }

    /// Codes that signal a FIFO producer/consumer mismatch
    pub fn is_overrun(self) -> bool {
        matches!(self, Self::FIFO_HW_OVERRUN | Self::FIFO_BUFFER_OVERRUN)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, self.message())
    }
}

/// Coarse grouping of fault codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCategory {
    /// No fault
    Ok,
    /// Driver or library initialisation problem
    Driver,
    /// Handle is invalid or closed
    Handle,
    /// Card is busy, locked or claimed elsewhere
    Access,
    /// A register or value was rejected
    Parameter,
    /// Command issued in the wrong order
    Sequence,
    /// A hardware configuration rule was broken
    Configuration,
    /// Buffer definition problem
    Buffer,
    /// FIFO streaming fault
    Fifo,
    /// Wait exceeded its timeout
    Timeout,
    /// Physical hardware condition
    Hardware,
    /// Remote chassis transport problem
    Network,
    /// Code missing from the table
    Unknown,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCategory::Ok => "ok",
            FaultCategory::Driver => "driver",
            FaultCategory::Handle => "handle",
            FaultCategory::Access => "access",
            FaultCategory::Parameter => "parameter",
            FaultCategory::Sequence => "sequence",
            FaultCategory::Configuration => "configuration",
            FaultCategory::Buffer => "buffer",
            FaultCategory::Fifo => "fifo",
            FaultCategory::Timeout => "timeout",
            FaultCategory::Hardware => "hardware",
            FaultCategory::Network => "network",
            FaultCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Driver address of one physical card
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Address from a raw driver string
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Locally installed card by index
    pub fn local(index: usize) -> Self {
        Self(format!("/dev/spcm{index}"))
    }

    /// Card inside a remote chassis
    pub fn network(host: &str, index: usize) -> Self {
        Self(format!("TCPIP[0]::{host}::inst{index}::INSTR"))
    }

    /// Raw driver string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which data stream a transfer buffer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// Sample data
    Data,
    /// Trigger timestamps
    Timestamp,
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferDirection {
    /// Card to PC (acquisition)
    CardToHost,
    /// PC to card (generation)
    HostToCard,
}

/// Page-locked host memory shared between the host and the driver
///
/// Reads and writes wrap around the end of the region so that a chunk
/// straddling the boundary is presented as one contiguous slice.
#[derive(Debug, Clone)]
pub struct HostMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
    len: usize,
}

impl HostMemory {
    /// Zeroed region of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
            len,
        }
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-sized region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `count` bytes starting at `start`, wrapping at the end
    pub fn read_wrapping(&self, start: usize, count: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let mut out = Vec::with_capacity(count);
        if self.len == 0 {
            return out;
        }
        let start = start % self.len;
        let first = count.min(self.len - start);
        out.extend_from_slice(&bytes[start..start + first]);
        let mut remaining = count - first;
        while remaining > 0 {
            let piece = remaining.min(self.len);
            out.extend_from_slice(&bytes[..piece]);
            remaining -= piece;
        }
        out
    }

    /// Copy `data` in starting at `start`, wrapping at the end
    pub fn write_wrapping(&self, start: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        if self.len == 0 {
            return;
        }
        let mut position = start % self.len;
        let mut rest = data;
        while !rest.is_empty() {
            let piece = rest.len().min(self.len - position);
            bytes[position..position + piece].copy_from_slice(&rest[..piece]);
            rest = &rest[piece..];
            position = (position + piece) % self.len;
        }
    }
}

/// Everything the driver needs to bind host memory to a card stream
#[derive(Debug, Clone)]
pub struct TransferDefinition {
    /// Stream carried by the buffer
    pub kind: BufferKind,
    /// Transfer direction
    pub direction: BufferDirection,
    /// Bytes per driver notification
    pub notify_bytes: usize,
    /// Shared host memory
    pub memory: HostMemory,
}

/// Little-endian bytes of 16-bit samples
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// 16-bit samples from little-endian bytes; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Status bits of the card status register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardStatus(pub u32);

impl CardStatus {
    /// Any of the given bits set
    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// Names of the bits that are set
    pub fn flags(self) -> Vec<&'static str> {
        use super::registers::status;
        [
            (status::PRETRIGGER, "pretrigger"),
            (status::TRIGGER, "trigger"),
            (status::READY, "ready"),
            (status::SEGMENT_PRETRIGGER, "segment pretrigger"),
            (status::DATA_BLOCK_READY, "data block ready"),
            (status::DATA_END, "data end"),
            (status::DATA_OVERRUN, "data overrun"),
            (status::DATA_ERROR, "data error"),
            (status::EXTRA_BLOCK_READY, "extra block ready"),
            (status::EXTRA_END, "extra end"),
            (status::EXTRA_OVERRUN, "extra overrun"),
            (status::EXTRA_ERROR, "extra error"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_memory_wraps_reads_and_writes() {
        let memory = HostMemory::new(8);
        memory.write_wrapping(6, &[1, 2, 3, 4]);
        assert_eq!(memory.read_wrapping(6, 4), vec![1, 2, 3, 4]);
        assert_eq!(memory.read_wrapping(0, 2), vec![3, 4]);
    }

    #[test]
    fn test_fault_code_lookup() {
        assert_eq!(FaultCode::TIMEOUT.category(), FaultCategory::Timeout);
        assert!(FaultCode::FIFO_HW_OVERRUN.is_overrun());
        assert!(!FaultCode::BOARD_LOCKED.is_overrun());
        assert_eq!(FaultCode(0x7777).category(), FaultCategory::Unknown);
    }

    #[test]
    fn test_status_flags() {
        use crate::hal::registers::status;
        let status = CardStatus(status::READY | status::DATA_OVERRUN);
        assert_eq!(status.flags(), vec!["ready", "data overrun"]);
    }

    #[test]
    fn test_addresses() {
        assert_eq!(DeviceAddress::local(2).as_str(), "/dev/spcm2");
        assert_eq!(
            DeviceAddress::network("192.168.1.10", 1).to_string(),
            "TCPIP[0]::192.168.1.10::inst1::INSTR"
        );
    }
}
