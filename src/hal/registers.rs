// src/hal/registers.rs
//! Register catalogue and the bit values written to them
//!
//! Scalar registers are plain constants. Per-channel, per-line and
//! per-generator registers are described by a [`RegisterFamily`] that yields
//! the concrete [`Register`] for an index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Register width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterWidth {
    /// 32-bit signed register
    Bits32,
    /// 64-bit signed register
    Bits64,
}

/// Register access rights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

/// One catalogue entry
#[derive(Debug, Clone, Copy)]
pub struct Register {
    name: &'static str,
    index: Option<u8>,
    address: u32,
    width: RegisterWidth,
    access: Access,
}

impl Register {
    /// Scalar catalogue entry
    pub const fn scalar(name: &'static str, address: u32, width: RegisterWidth, access: Access) -> Self {
        Self { name, index: None, address, width, access }
    }

    /// Symbolic name without index
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index within its family, if any
    pub fn index(&self) -> Option<usize> {
        self.index.map(usize::from)
    }

    /// Driver address
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Width of the register
    pub fn width(&self) -> RegisterWidth {
        self.width
    }

    /// Access rights
    pub fn access(&self) -> Access {
        self.access
    }

    /// Register accepts reads
    pub fn is_readable(&self) -> bool {
        matches!(self.access, Access::Read | Access::ReadWrite)
    }

    /// Register accepts writes
    pub fn is_writable(&self) -> bool {
        matches!(self.access, Access::Write | Access::ReadWrite)
    }

    /// Value is representable in the register width
    pub fn fits(&self, value: i64) -> bool {
        match self.width {
            RegisterWidth::Bits32 => i32::try_from(value).is_ok() || u32::try_from(value).is_ok(),
            RegisterWidth::Bits64 => true,
        }
    }

    /// Look a register up by symbol, e.g. `SAMPLE_RATE` or `AMPLITUDE[2]`
    pub fn lookup(symbol: &str) -> Option<Register> {
        let symbol = symbol.trim();
        if let Some((family, rest)) = symbol.split_once('[') {
            let index: usize = rest.strip_suffix(']')?.trim().parse().ok()?;
            return FAMILIES
                .iter()
                .find(|f| f.name == family.trim())
                .and_then(|f| f.get(index));
        }
        SCALARS.iter().find(|r| r.name == symbol).copied()
    }
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Register {}

impl Hash for Register {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.name, index),
            None => f.write_str(self.name),
        }
    }
}

/// Indexed group of registers with a fixed address stride
#[derive(Debug, Clone, Copy)]
pub struct RegisterFamily {
    name: &'static str,
    base: u32,
    stride: u32,
    count: u8,
    width: RegisterWidth,
    access: Access,
}

impl RegisterFamily {
    const fn new(name: &'static str, base: u32, stride: u32, count: u8, width: RegisterWidth, access: Access) -> Self {
        Self { name, base, stride, count, width, access }
    }

    /// Family name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of members
    pub fn len(&self) -> usize {
        usize::from(self.count)
    }

    /// Always false; families are never empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Member at `index`, if it exists
    pub fn get(&self, index: usize) -> Option<Register> {
        if index >= self.len() {
            return None;
        }
        Some(self.at(index))
    }

    /// Member at `index`; indices past the family end map to addresses the
    /// driver rejects as unknown registers
    pub fn at(&self, index: usize) -> Register {
        let slot = u8::try_from(index).unwrap_or(u8::MAX);
        Register {
            name: self.name,
            index: Some(slot),
            address: self.base + self.stride * u32::from(slot),
            width: self.width,
            access: self.access,
        }
    }
}

use Access::{Read as R, ReadWrite as RW, Write as W};
use RegisterWidth::{Bits32 as B32, Bits64 as B64};

// Command and status
pub const CARD_COMMAND: Register = Register::scalar("CARD_COMMAND", 100, B32, W);
pub const CARD_STATUS: Register = Register::scalar("CARD_STATUS", 110, B32, R);

// Transfer positions
pub const DATA_AVAIL_USER_LEN: Register = Register::scalar("DATA_AVAIL_USER_LEN", 200, B64, R);
pub const DATA_AVAIL_USER_POS: Register = Register::scalar("DATA_AVAIL_USER_POS", 201, B64, R);
pub const DATA_AVAIL_CARD_LEN: Register = Register::scalar("DATA_AVAIL_CARD_LEN", 202, B64, W);
pub const TS_AVAIL_USER_LEN: Register = Register::scalar("TS_AVAIL_USER_LEN", 210, B64, R);
pub const TS_AVAIL_USER_POS: Register = Register::scalar("TS_AVAIL_USER_POS", 211, B64, R);
pub const TS_AVAIL_CARD_LEN: Register = Register::scalar("TS_AVAIL_CARD_LEN", 212, B64, W);

// Card identity and geometry
pub const MODULES: Register = Register::scalar("MODULES", 1100, B32, R);
pub const CHANNELS_PER_MODULE: Register = Register::scalar("CHANNELS_PER_MODULE", 1110, B32, R);
pub const BYTES_PER_SAMPLE: Register = Register::scalar("BYTES_PER_SAMPLE", 1120, B32, R);
pub const MAX_ADC_VALUE: Register = Register::scalar("MAX_ADC_VALUE", 1126, B32, R);
pub const CARD_TYPE: Register = Register::scalar("CARD_TYPE", 2000, B32, R);
pub const FUNCTION_TYPE: Register = Register::scalar("FUNCTION_TYPE", 2001, B32, R);
pub const SERIAL_NUMBER: Register = Register::scalar("SERIAL_NUMBER", 2030, B32, R);
pub const FEATURES: Register = Register::scalar("FEATURES", 2120, B32, R);
pub const EXT_FEATURES: Register = Register::scalar("EXT_FEATURES", 2121, B32, R);
pub const PRETRIGGER_LIMIT: Register = Register::scalar("PRETRIGGER_LIMIT", 2140, B64, R);
pub const MEMORY_STEP: Register = Register::scalar("MEMORY_STEP", 2141, B32, R);

// Acquisition and generation
pub const CARD_MODE: Register = Register::scalar("CARD_MODE", 9500, B32, RW);
pub const MEMORY_SIZE: Register = Register::scalar("MEMORY_SIZE", 10000, B64, RW);
pub const SEGMENT_SIZE: Register = Register::scalar("SEGMENT_SIZE", 10010, B64, RW);
pub const LOOPS: Register = Register::scalar("LOOPS", 10020, B64, RW);
pub const POST_TRIGGER: Register = Register::scalar("POST_TRIGGER", 10100, B64, RW);
pub const AVERAGES: Register = Register::scalar("AVERAGES", 10150, B32, RW);
pub const CHANNEL_ENABLE: Register = Register::scalar("CHANNEL_ENABLE", 11000, B64, RW);
pub const SAMPLE_RATE: Register = Register::scalar("SAMPLE_RATE", 20000, B64, RW);
pub const REFERENCE_CLOCK: Register = Register::scalar("REFERENCE_CLOCK", 20140, B64, RW);
pub const CLOCK_MODE: Register = Register::scalar("CLOCK_MODE", 20200, B32, RW);
pub const TIMEOUT: Register = Register::scalar("TIMEOUT", 295130, B32, RW);

// Trigger
pub const TRIG_OR_MASK: Register = Register::scalar("TRIG_OR_MASK", 40410, B32, RW);
pub const TRIG_AND_MASK: Register = Register::scalar("TRIG_AND_MASK", 40430, B32, RW);
pub const TRIG_CH_OR_MASK: Register = Register::scalar("TRIG_CH_OR_MASK", 40450, B32, RW);
pub const TRIG_CH_AND_MASK: Register = Register::scalar("TRIG_CH_AND_MASK", 40470, B32, RW);
pub const TIMESTAMP_COMMAND: Register = Register::scalar("TIMESTAMP_COMMAND", 47000, B32, RW);

// Star-hub
pub const SYNC_ENABLE_MASK: Register = Register::scalar("SYNC_ENABLE_MASK", 49200, B32, RW);
pub const SYNC_CLOCK_MASK: Register = Register::scalar("SYNC_CLOCK_MASK", 49220, B32, RW);

// Pulse generators, shared
pub const PULSEGEN_ENABLE: Register = Register::scalar("PULSEGEN_ENABLE", 600100, B32, RW);
pub const PULSEGEN_COMMAND: Register = Register::scalar("PULSEGEN_COMMAND", 600110, B32, W);
pub const PULSEGEN_CLOCK: Register = Register::scalar("PULSEGEN_CLOCK", 600120, B64, R);
pub const PULSEGEN_LEN_MIN: Register = Register::scalar("PULSEGEN_LEN_MIN", 602001, B64, R);
pub const PULSEGEN_LEN_MAX: Register = Register::scalar("PULSEGEN_LEN_MAX", 602002, B64, R);
pub const PULSEGEN_LEN_STEP: Register = Register::scalar("PULSEGEN_LEN_STEP", 602003, B64, R);
pub const PULSEGEN_HIGH_MIN: Register = Register::scalar("PULSEGEN_HIGH_MIN", 602004, B64, R);
pub const PULSEGEN_HIGH_MAX: Register = Register::scalar("PULSEGEN_HIGH_MAX", 602005, B64, R);
pub const PULSEGEN_HIGH_STEP: Register = Register::scalar("PULSEGEN_HIGH_STEP", 602006, B64, R);
pub const PULSEGEN_DELAY_MIN: Register = Register::scalar("PULSEGEN_DELAY_MIN", 602007, B64, R);
pub const PULSEGEN_DELAY_MAX: Register = Register::scalar("PULSEGEN_DELAY_MAX", 602008, B64, R);
pub const PULSEGEN_DELAY_STEP: Register = Register::scalar("PULSEGEN_DELAY_STEP", 602009, B64, R);
pub const PULSEGEN_LOOPS_MIN: Register = Register::scalar("PULSEGEN_LOOPS_MIN", 602010, B64, R);
pub const PULSEGEN_LOOPS_MAX: Register = Register::scalar("PULSEGEN_LOOPS_MAX", 602011, B64, R);
pub const PULSEGEN_LOOPS_STEP: Register = Register::scalar("PULSEGEN_LOOPS_STEP", 602012, B64, R);

// Per channel
pub const AMPLITUDE: RegisterFamily = RegisterFamily::new("AMPLITUDE", 30010, 100, 16, B32, RW);
pub const OFFSET: RegisterFamily = RegisterFamily::new("OFFSET", 30000, 100, 16, B32, RW);
pub const IMPEDANCE_50_OHM: RegisterFamily = RegisterFamily::new("IMPEDANCE_50_OHM", 30030, 100, 16, B32, RW);
pub const FILTER: RegisterFamily = RegisterFamily::new("FILTER", 30080, 100, 16, B32, RW);
pub const OUTPUT_ENABLE: RegisterFamily = RegisterFamily::new("OUTPUT_ENABLE", 30091, 100, 16, B32, RW);
pub const STOP_LEVEL: RegisterFamily = RegisterFamily::new("STOP_LEVEL", 206020, 1, 16, B32, RW);
pub const CUSTOM_STOP: RegisterFamily = RegisterFamily::new("CUSTOM_STOP", 206050, 1, 16, B32, RW);
pub const TRIG_CH_MODE: RegisterFamily = RegisterFamily::new("TRIG_CH_MODE", 40610, 1, 16, B32, RW);
pub const TRIG_CH_LEVEL: RegisterFamily = RegisterFamily::new("TRIG_CH_LEVEL", 42200, 1, 16, B32, RW);

// Per external trigger line
pub const TRIG_EXT_MODE: RegisterFamily = RegisterFamily::new("TRIG_EXT_MODE", 40510, 1, 4, B32, RW);
pub const TRIG_EXT_LEVEL: RegisterFamily = RegisterFamily::new("TRIG_EXT_LEVEL", 42320, 10, 4, B32, RW);
pub const TRIG_EXT_PULSE_WIDTH: RegisterFamily =
    RegisterFamily::new("TRIG_EXT_PULSE_WIDTH", 44210, 1, 4, B32, RW);

// Per I/O line
pub const XIO_MODE: RegisterFamily = RegisterFamily::new("XIO_MODE", 47200, 1, 4, B32, RW);
pub const XIO_AVAIL_MODES: RegisterFamily = RegisterFamily::new("XIO_AVAIL_MODES", 47210, 1, 4, B32, R);

// Per pulse generator
pub const PULSEGEN_LEN: RegisterFamily = RegisterFamily::new("PULSEGEN_LEN", 601000, 100, 4, B64, RW);
pub const PULSEGEN_HIGH: RegisterFamily = RegisterFamily::new("PULSEGEN_HIGH", 601001, 100, 4, B64, RW);
pub const PULSEGEN_LOOPS: RegisterFamily = RegisterFamily::new("PULSEGEN_LOOPS", 601002, 100, 4, B64, RW);
pub const PULSEGEN_DELAY: RegisterFamily = RegisterFamily::new("PULSEGEN_DELAY", 601003, 100, 4, B64, RW);
pub const PULSEGEN_MODE: RegisterFamily = RegisterFamily::new("PULSEGEN_MODE", 601004, 100, 4, B32, RW);
pub const PULSEGEN_MUX1: RegisterFamily = RegisterFamily::new("PULSEGEN_MUX1", 601005, 100, 4, B32, RW);
pub const PULSEGEN_MUX2: RegisterFamily = RegisterFamily::new("PULSEGEN_MUX2", 601006, 100, 4, B32, RW);
pub const PULSEGEN_CONFIG: RegisterFamily = RegisterFamily::new("PULSEGEN_CONFIG", 601007, 100, 4, B32, RW);

static SCALARS: &[Register] = &[
    CARD_COMMAND,
    CARD_STATUS,
    DATA_AVAIL_USER_LEN,
    DATA_AVAIL_USER_POS,
    DATA_AVAIL_CARD_LEN,
    TS_AVAIL_USER_LEN,
    TS_AVAIL_USER_POS,
    TS_AVAIL_CARD_LEN,
    MODULES,
    CHANNELS_PER_MODULE,
    BYTES_PER_SAMPLE,
    MAX_ADC_VALUE,
    CARD_TYPE,
    FUNCTION_TYPE,
    SERIAL_NUMBER,
    FEATURES,
    EXT_FEATURES,
    PRETRIGGER_LIMIT,
    MEMORY_STEP,
    CARD_MODE,
    MEMORY_SIZE,
    SEGMENT_SIZE,
    LOOPS,
    POST_TRIGGER,
    AVERAGES,
    CHANNEL_ENABLE,
    SAMPLE_RATE,
    REFERENCE_CLOCK,
    CLOCK_MODE,
    TIMEOUT,
    TRIG_OR_MASK,
    TRIG_AND_MASK,
    TRIG_CH_OR_MASK,
    TRIG_CH_AND_MASK,
    TIMESTAMP_COMMAND,
    SYNC_ENABLE_MASK,
    SYNC_CLOCK_MASK,
    PULSEGEN_ENABLE,
    PULSEGEN_COMMAND,
    PULSEGEN_CLOCK,
    PULSEGEN_LEN_MIN,
    PULSEGEN_LEN_MAX,
    PULSEGEN_LEN_STEP,
    PULSEGEN_HIGH_MIN,
    PULSEGEN_HIGH_MAX,
    PULSEGEN_HIGH_STEP,
    PULSEGEN_DELAY_MIN,
    PULSEGEN_DELAY_MAX,
    PULSEGEN_DELAY_STEP,
    PULSEGEN_LOOPS_MIN,
    PULSEGEN_LOOPS_MAX,
    PULSEGEN_LOOPS_STEP,
];

static FAMILIES: &[RegisterFamily] = &[
    AMPLITUDE,
    OFFSET,
    IMPEDANCE_50_OHM,
    FILTER,
    OUTPUT_ENABLE,
    STOP_LEVEL,
    CUSTOM_STOP,
    TRIG_CH_MODE,
    TRIG_CH_LEVEL,
    TRIG_EXT_MODE,
    TRIG_EXT_LEVEL,
    TRIG_EXT_PULSE_WIDTH,
    XIO_MODE,
    XIO_AVAIL_MODES,
    PULSEGEN_LEN,
    PULSEGEN_HIGH,
    PULSEGEN_LOOPS,
    PULSEGEN_DELAY,
    PULSEGEN_MODE,
    PULSEGEN_MUX1,
    PULSEGEN_MUX2,
    PULSEGEN_CONFIG,
];

/// Every register in the catalogue, families expanded
pub fn catalogue() -> impl Iterator<Item = Register> {
    SCALARS
        .iter()
        .copied()
        .chain(FAMILIES.iter().flat_map(|f| (0..f.len()).map(move |i| f.at(i))))
}

/// Command bits for [`CARD_COMMAND`]
pub mod command {
    pub const CARD_RESET: i64 = 0x1;
    pub const WRITE_SETUP: i64 = 0x2;
    pub const CARD_START: i64 = 0x4;
    pub const ENABLE_TRIGGER: i64 = 0x8;
    pub const FORCE_TRIGGER: i64 = 0x10;
    pub const DISABLE_TRIGGER: i64 = 0x20;
    pub const CARD_STOP: i64 = 0x40;
    pub const WAIT_PREFULL: i64 = 0x1000;
    pub const WAIT_TRIGGER: i64 = 0x2000;
    pub const WAIT_READY: i64 = 0x4000;
    pub const DATA_START_DMA: i64 = 0x10000;
    pub const DATA_WAIT_DMA: i64 = 0x20000;
    pub const DATA_STOP_DMA: i64 = 0x40000;
    pub const DATA_POLL: i64 = 0x80000;
    pub const EXTRA_START_DMA: i64 = 0x100000;
    pub const EXTRA_WAIT_DMA: i64 = 0x200000;
    pub const EXTRA_STOP_DMA: i64 = 0x400000;
    pub const EXTRA_POLL: i64 = 0x800000;
}

/// Bits of [`CARD_STATUS`]
pub mod status {
    pub const PRETRIGGER: u32 = 0x1;
    pub const TRIGGER: u32 = 0x2;
    pub const READY: u32 = 0x4;
    pub const SEGMENT_PRETRIGGER: u32 = 0x8;
    pub const DATA_BLOCK_READY: u32 = 0x100;
    pub const DATA_END: u32 = 0x200;
    pub const DATA_OVERRUN: u32 = 0x400;
    pub const DATA_ERROR: u32 = 0x800;
    pub const EXTRA_BLOCK_READY: u32 = 0x1000;
    pub const EXTRA_END: u32 = 0x2000;
    pub const EXTRA_OVERRUN: u32 = 0x4000;
    pub const EXTRA_ERROR: u32 = 0x8000;
}

/// Values of [`CARD_MODE`]
pub mod card_mode {
    pub const STD_SINGLE: i64 = 0x1;
    pub const STD_MULTI: i64 = 0x2;
    pub const FIFO_MULTI: i64 = 0x20;
    pub const STD_AVERAGE: i64 = 0x40000;
    pub const FIFO_AVERAGE: i64 = 0x200000;
    pub const REP_STD_SINGLE: i64 = 0x100;
    pub const REP_FIFO_SINGLE: i64 = 0x800;
    pub const REP_STD_SINGLE_RESTART: i64 = 0x8000;
}

/// Source bits of [`TRIG_OR_MASK`] and [`TRIG_AND_MASK`]
pub mod trigger_mask {
    pub const NONE: i64 = 0x0;
    pub const SOFTWARE: i64 = 0x1;
    pub const EXT0: i64 = 0x2;
}

/// Values of the trigger mode registers
pub mod trigger_mode {
    pub const NONE: i64 = 0x0;
    pub const POSITIVE: i64 = 0x1;
    pub const NEGATIVE: i64 = 0x2;
    pub const BOTH: i64 = 0x4;
    pub const HIGH: i64 = 0x8;
    pub const LOW: i64 = 0x10;
}

/// Values of [`CLOCK_MODE`]
pub mod clock_mode {
    pub const INTERNAL_PLL: i64 = 0x1;
    pub const EXTERNAL: i64 = 0x8;
    pub const EXTERNAL_REFERENCE: i64 = 0x20;
}

/// Values of [`TIMESTAMP_COMMAND`]
pub mod timestamp {
    pub const RESET: i64 = 0x1;
    pub const MODE_STANDARD: i64 = 0x1000;
    pub const MODE_START_RESET: i64 = 0x20000;
    pub const MODE_DISABLE: i64 = 0x0;
}

/// Values of [`FUNCTION_TYPE`]
pub mod function_type {
    pub const ANALOG_IN: i64 = 0x1;
    pub const ANALOG_OUT: i64 = 0x2;
}

/// Bits of [`FEATURES`] and [`EXT_FEATURES`]
pub mod features {
    pub const MULTI: i64 = 0x1;
    pub const TIMESTAMP: i64 = 0x10;
    pub const STARHUB: i64 = 0x20;
    pub const BASE_XIO: i64 = 0x80;
    pub const EXT_PULSE_GENERATOR: i64 = 0x4;
}

/// Values of [`STOP_LEVEL`]
pub mod stop_level {
    pub const TRISTATE: i64 = 0x1;
    pub const LOW: i64 = 0x2;
    pub const HIGH: i64 = 0x4;
    pub const HOLD_LAST: i64 = 0x8;
    pub const ZERO: i64 = 0x10;
    pub const CUSTOM: i64 = 0x20;
}

/// Values of [`XIO_MODE`]
pub mod xio_mode {
    pub const DISABLE: i64 = 0x0;
    pub const ASYNC_IN: i64 = 0x1;
    pub const ASYNC_OUT: i64 = 0x2;
    pub const TRIGGER_IN: i64 = 0x10;
    pub const TRIGGER_OUT: i64 = 0x20;
    pub const RUN_STATE: i64 = 0x100;
    pub const ARM_STATE: i64 = 0x200;
    pub const PULSE_GENERATOR: i64 = 0x8000;
}

/// Values for the pulse generator registers
pub mod pulsegen {
    pub const MODE_GATED: i64 = 0x1;
    pub const MODE_TRIGGERED: i64 = 0x2;
    pub const MODE_SINGLE_SHOT: i64 = 0x3;

    pub const CONFIG_MUX1_INVERT: i64 = 0x1;
    pub const CONFIG_MUX2_INVERT: i64 = 0x2;
    pub const CONFIG_INVERT: i64 = 0x4;
    pub const CONFIG_HIGH: i64 = 0x8;

    pub const MUX1_UNUSED: i64 = 0x0;
    pub const MUX1_RUN_STATE: i64 = 0x1;
    pub const MUX1_ARM_STATE: i64 = 0x2;

    pub const MUX2_UNUSED: i64 = 0x0;
    pub const MUX2_SOFTWARE: i64 = 0x1;
    pub const MUX2_PULSEGEN0: i64 = 0x2;
    pub const MUX2_XIO0: i64 = 0x6;

    pub const COMMAND_FORCE: i64 = 0x1;
}
