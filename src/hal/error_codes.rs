// src/hal/error_codes.rs
//! Static lookup of driver fault codes

use super::types::{FaultCategory, FaultCode};

struct FaultEntry {
    code: u32,
    category: FaultCategory,
    message: &'static str,
}

const fn entry(code: u32, category: FaultCategory, message: &'static str) -> FaultEntry {
    FaultEntry { code, category, message }
}

// Sorted by code for binary search.
static FAULT_TABLE: &[FaultEntry] = &[
    entry(0x0000, FaultCategory::Ok, "no error"),
    entry(0x0001, FaultCategory::Driver, "driver initialisation failed"),
    entry(0x0002, FaultCategory::Driver, "card number out of range"),
    entry(0x0003, FaultCategory::Driver, "unknown card type"),
    entry(0x0004, FaultCategory::Driver, "function not supported by this card"),
    entry(0x0005, FaultCategory::Driver, "card memory remapping failed"),
    entry(0x0006, FaultCategory::Driver, "kernel driver version mismatch"),
    entry(0x0007, FaultCategory::Driver, "hardware/driver version mismatch"),
    entry(0x0008, FaultCategory::Driver, "address range disabled"),
    entry(0x0009, FaultCategory::Handle, "invalid card handle"),
    entry(0x000A, FaultCategory::Access, "card not found"),
    entry(0x000B, FaultCategory::Access, "card is already opened by another process"),
    entry(0x000D, FaultCategory::Driver, "firmware version does not match"),
    entry(0x000E, FaultCategory::Driver, "sync protocol mismatch"),
    entry(0x0010, FaultCategory::Driver, "previous error has not been read"),
    entry(0x0020, FaultCategory::Sequence, "abort of wait function"),
    entry(0x0030, FaultCategory::Access, "card is locked by another process"),
    entry(0x0032, FaultCategory::Access, "device mapping failed"),
    entry(0x0040, FaultCategory::Network, "network setup failed"),
    entry(0x0041, FaultCategory::Network, "network data transfer failed"),
    entry(0x0042, FaultCategory::Hardware, "power cycle required after firmware update"),
    entry(0x0043, FaultCategory::Network, "network timeout"),
    entry(0x0044, FaultCategory::Buffer, "buffer size not sufficient"),
    entry(0x0045, FaultCategory::Access, "restricted access"),
    entry(0x0046, FaultCategory::Parameter, "invalid function parameter"),
    entry(0x0047, FaultCategory::Hardware, "card temperature too high"),
    entry(0x0048, FaultCategory::Hardware, "fan speed out of range"),
    entry(0x0100, FaultCategory::Parameter, "unknown register"),
    entry(0x0101, FaultCategory::Parameter, "register value out of range"),
    entry(0x0102, FaultCategory::Parameter, "feature not installed"),
    entry(0x0103, FaultCategory::Sequence, "command sequence not allowed"),
    entry(0x0104, FaultCategory::Sequence, "read not allowed after abort"),
    entry(0x0105, FaultCategory::Access, "access to register denied"),
    entry(0x0107, FaultCategory::Timeout, "timeout while waiting"),
    entry(0x0108, FaultCategory::Parameter, "call type not allowed for register"),
    entry(0x0109, FaultCategory::Parameter, "value exceeds 32 bit range"),
    entry(0x010A, FaultCategory::Access, "register is read only"),
    entry(0x010B, FaultCategory::Configuration, "invalid card setup"),
    entry(0x010C, FaultCategory::Hardware, "clock not locked"),
    entry(0x010D, FaultCategory::Hardware, "on-board memory initialisation failed"),
    entry(0x010E, FaultCategory::Hardware, "power supply failure"),
    entry(0x010F, FaultCategory::Hardware, "ADC communication failed"),
    entry(0x0110, FaultCategory::Configuration, "invalid channel selection"),
    entry(0x0111, FaultCategory::Buffer, "invalid notify size"),
    entry(0x0120, FaultCategory::Sequence, "command not allowed while card is running"),
    entry(0x0130, FaultCategory::Hardware, "calibration failed"),
    entry(0x0140, FaultCategory::Configuration, "pretrigger length exceeds pretrigger memory"),
    entry(0x0141, FaultCategory::Buffer, "transfer direction does not match buffer"),
    entry(0x0142, FaultCategory::Configuration, "post trigger exceeds segment size"),
    entry(0x0143, FaultCategory::Configuration, "memory size is not a multiple of segment size"),
    entry(0x0144, FaultCategory::Configuration, "multiple pulse width triggers"),
    entry(0x0145, FaultCategory::Configuration, "pulse width trigger without channel in OR mask"),
    entry(0x0146, FaultCategory::Configuration, "AND and OR trigger masks overlap"),
    entry(0x0147, FaultCategory::Configuration, "edge trigger mode used in AND mask"),
    entry(0x0148, FaultCategory::Configuration, "level trigger mode used in OR mask"),
    entry(0x0149, FaultCategory::Configuration, "different trigger edges within one module"),
    entry(0x014A, FaultCategory::Configuration, "trigger levels too close"),
    entry(0x014B, FaultCategory::Configuration, "star-hub enable mask invalid"),
    entry(0x0200, FaultCategory::Driver, "no PCI bus found"),
    entry(0x0204, FaultCategory::Buffer, "DMA buffer locked"),
    entry(0x0205, FaultCategory::Buffer, "memory allocation failed"),
    entry(0x0207, FaultCategory::Driver, "card type not supported by driver"),
    entry(0x0300, FaultCategory::Fifo, "FIFO software buffer overrun"),
    entry(0x0301, FaultCategory::Fifo, "FIFO hardware overrun"),
    entry(0x0302, FaultCategory::Fifo, "FIFO transfer already finished"),
    entry(0x0309, FaultCategory::Fifo, "FIFO setup invalid"),
    entry(0x0310, FaultCategory::Hardware, "timestamp synchronisation failed"),
    entry(0x0320, FaultCategory::Hardware, "star-hub communication failed"),
    entry(0xFFFF, FaultCategory::Driver, "internal driver error"),
];

/// Category and message for a fault code
pub fn describe(code: FaultCode) -> (FaultCategory, &'static str) {
    FAULT_TABLE
        .binary_search_by_key(&code.0, |entry| entry.code)
        .map(|i| (FAULT_TABLE[i].category, FAULT_TABLE[i].message))
        .unwrap_or((FaultCategory::Unknown, "unknown fault code"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted_for_lookup() {
        assert!(FAULT_TABLE.windows(2).all(|w| w[0].code < w[1].code));
    }

    #[test]
    fn test_describe_known_codes() {
        assert_eq!(describe(FaultCode::OK).0, FaultCategory::Ok);
        assert_eq!(
            describe(FaultCode::AND_OR_MASK_OVERLAP),
            (FaultCategory::Configuration, "AND and OR trigger masks overlap")
        );
        assert_eq!(describe(FaultCode::BOARD_LOCKED).0, FaultCategory::Access);
    }
}
