// src/acquisition/timestamps.rs
//! Trigger timestamps read by polling the card's timestamp stream
//!
//! Polling adds a few milliseconds between the trigger and the host noticing
//! its stamp. The stamp itself is taken by the card, so the reported time is
//! only limited by the reference time captured when the counter was reset.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use super::transfer_buffer::{BufferSpec, TransferBuffer};
use crate::config::{timestamps, TimestampConfig};
use crate::error::{CardError, CardResult, IntoCardError};
use crate::hal::registers::{self, command, timestamp};
use crate::hal::{BufferDirection, BufferKind, RegisterInterface};

/// Reads one 16-byte stamp per trigger and converts it to wall-clock time
#[derive(Debug)]
pub struct Timestamper {
    buffer: TransferBuffer,
    reference: DateTime<Utc>,
    sample_rate_hz: u64,
    software_only: bool,
    poll_interval: Duration,
    max_polls: u32,
    kept: Vec<u8>,
}

impl Timestamper {
    /// Bind a timestamp buffer, reset the card counter and start polling
    ///
    /// With `software_only` set the card never stamps a hardware event, so
    /// the host clock at retrieval is reported instead.
    pub fn enable(
        io: &dyn RegisterInterface,
        sample_rate_hz: u64,
        software_only: bool,
        config: &TimestampConfig,
    ) -> CardResult<Self> {
        let buffer = TransferBuffer::allocate(BufferSpec::single_transfer(
            BufferKind::Timestamp,
            BufferDirection::CardToHost,
            config.buffer_bytes,
        ))?;
        buffer.attach(io)?;
        io.write(registers::TIMESTAMP_COMMAND, timestamp::MODE_STANDARD)
            .on_register(registers::TIMESTAMP_COMMAND)?;
        io.write(registers::CARD_COMMAND, command::WRITE_SETUP)
            .on_register(registers::CARD_COMMAND)?;
        let reference = Utc::now();
        io.write(registers::TIMESTAMP_COMMAND, timestamp::MODE_STANDARD | timestamp::RESET)
            .on_register(registers::TIMESTAMP_COMMAND)?;
        io.write(registers::CARD_COMMAND, command::EXTRA_POLL)
            .on_register(registers::CARD_COMMAND)?;
        debug!(%reference, sample_rate_hz, software_only, "timestamping enabled");
        Ok(Self {
            buffer,
            reference,
            sample_rate_hz: sample_rate_hz.max(1),
            software_only,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_poll_count.max(1),
            kept: Vec::with_capacity(timestamps::BYTES_PER_TIMESTAMP),
        })
    }

    /// Host time the card counter was reset at
    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Time of the next trigger event in the stream
    pub fn next_timestamp(&mut self, io: &dyn RegisterInterface) -> CardResult<DateTime<Utc>> {
        if self.software_only {
            return Ok(Utc::now());
        }
        let mut polls = 0;
        while self.kept.len() < timestamps::BYTES_PER_TIMESTAMP {
            if polls == self.max_polls {
                return Err(CardError::Timeout {
                    operation: format!("timestamp poll ({} polls)", self.max_polls),
                });
            }
            let missing = timestamps::BYTES_PER_TIMESTAMP - self.kept.len();
            let bytes = self.buffer.poll_bytes(io, missing)?;
            self.kept.extend_from_slice(&bytes);
            polls += 1;
            if self.kept.len() < timestamps::BYTES_PER_TIMESTAMP {
                thread::sleep(self.poll_interval);
            }
        }
        let stamp: Vec<u8> = self.kept.drain(..timestamps::BYTES_PER_TIMESTAMP).collect();
        let ticks = ticks_from_stamp(&stamp);
        trace!(ticks, polls, "timestamp read");
        Ok(self.reference + ticks_to_duration(ticks, self.sample_rate_hz))
    }

    /// Unbind the timestamp buffer
    pub fn disable(&self, io: &dyn RegisterInterface) -> CardResult<()> {
        io.write(registers::CARD_COMMAND, command::EXTRA_STOP_DMA)
            .on_register(registers::CARD_COMMAND)?;
        self.buffer.detach(io)
    }
}

/// Sample-clock ticks in the low 8 bytes of a stamp
pub fn ticks_from_stamp(stamp: &[u8]) -> u64 {
    let mut low = [0u8; 8];
    let n = stamp.len().min(8);
    low[..n].copy_from_slice(&stamp[..n]);
    u64::from_le_bytes(low)
}

/// Elapsed time of `ticks` sample-clock periods
pub fn ticks_to_duration(ticks: u64, sample_rate_hz: u64) -> ChronoDuration {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(sample_rate_hz.max(1));
    ChronoDuration::nanoseconds(i64::try_from(nanos).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_from_stamp() {
        let mut stamp = [0u8; 16];
        stamp[..8].copy_from_slice(&40_000_000u64.to_le_bytes());
        stamp[8..].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(ticks_from_stamp(&stamp), 40_000_000);
    }

    #[test]
    fn test_ticks_to_duration() {
        assert_eq!(ticks_to_duration(40_000_000, 40_000_000), ChronoDuration::seconds(1));
        assert_eq!(ticks_to_duration(5, 1_000_000), ChronoDuration::microseconds(5));
    }
}
