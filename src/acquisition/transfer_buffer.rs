// src/acquisition/transfer_buffer.rs
//! Host-side circular transfer buffer and the driver notify handshake
//!
//! The buffer is a ring shared with the driver. For card-to-host streams the
//! card produces and the host consumes; for host-to-card streams the roles
//! swap. Progress is exchanged through three registers per stream: the host
//! reads how many bytes it may touch (`*_AVAIL_USER_LEN`) and where they
//! start (`*_AVAIL_USER_POS`), and hands bytes back with `*_AVAIL_CARD_LEN`.

use tracing::{debug, trace};

use crate::config::{transfer, TransferConfig};
use crate::error::{CardError, CardResult, ConfigRule, IntoCardError};
use crate::hal::registers::{self, command};
use crate::hal::{
    bytes_to_samples, samples_to_bytes, BufferDirection, BufferKind, HostMemory, Register, RegisterInterface,
    TransferDefinition,
};

/// Requested geometry of a transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub kind: BufferKind,
    pub direction: BufferDirection,
    pub capacity_bytes: usize,
    pub notify_bytes: usize,
    /// Host page size used for notify legality
    pub page_size: usize,
}

impl BufferSpec {
    /// Buffer with an explicit notify size
    pub fn new(kind: BufferKind, direction: BufferDirection, capacity_bytes: usize, notify_bytes: usize) -> Self {
        Self {
            kind,
            direction,
            capacity_bytes,
            notify_bytes,
            page_size: transfer::PAGE_SIZE_BYTES,
        }
    }

    /// Buffer moved in one bulk transfer (notify equals capacity)
    pub fn single_transfer(kind: BufferKind, direction: BufferDirection, capacity_bytes: usize) -> Self {
        Self::new(kind, direction, capacity_bytes, capacity_bytes)
    }

    /// Default streaming buffer for frames of `frame_bytes`
    ///
    /// Notify granularity is `notify_pages` host pages; capacity holds
    /// `repeat_acquisitions` frames, rounded up to whole notify chunks.
    pub fn streaming(direction: BufferDirection, frame_bytes: usize, config: &TransferConfig) -> Self {
        let notify = config.default_notify_bytes();
        let wanted = frame_bytes.max(1) * config.repeat_acquisitions.max(1);
        let chunks = wanted.div_ceil(notify).max(transfer::MIN_STREAMING_CHUNKS);
        Self {
            page_size: config.page_size_bytes,
            ..Self::new(BufferKind::Data, direction, chunks * notify, notify)
        }
    }

    /// Override the page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Streaming buffer (more than one notify chunk)
    pub fn is_streaming(&self) -> bool {
        self.notify_bytes < self.capacity_bytes
    }

    /// Check capacity, notify legality and direction
    pub fn validate(&self) -> CardResult<()> {
        if self.capacity_bytes == 0 {
            return Err(CardError::config(ConfigRule::BufferCapacity, "buffer capacity must be non-zero"));
        }
        if self.notify_bytes == 0 || self.notify_bytes > self.capacity_bytes {
            return Err(CardError::config(
                ConfigRule::NotifyGranularity,
                format!(
                    "notify size {} outside 1..={} bytes",
                    self.notify_bytes, self.capacity_bytes
                ),
            ));
        }
        if self.is_streaming() {
            let page_multiple = self.page_size > 0 && self.notify_bytes % self.page_size == 0;
            if !page_multiple && !transfer::SUB_PAGE_NOTIFY_BYTES.contains(&self.notify_bytes) {
                return Err(CardError::config(
                    ConfigRule::NotifyGranularity,
                    format!(
                        "notify size {} is neither a multiple of {} nor a sub-page size",
                        self.notify_bytes, self.page_size
                    ),
                ));
            }
            if self.capacity_bytes < transfer::MIN_STREAMING_CHUNKS * self.notify_bytes {
                return Err(CardError::config(
                    ConfigRule::BufferCapacity,
                    format!(
                        "{} bytes cannot hold {} notify chunks of {}",
                        self.capacity_bytes,
                        transfer::MIN_STREAMING_CHUNKS,
                        self.notify_bytes
                    ),
                ));
            }
        }
        if self.kind == BufferKind::Timestamp && self.direction != BufferDirection::CardToHost {
            return Err(CardError::config(
                ConfigRule::TransferDirection,
                "timestamp buffers only transfer card to host",
            ));
        }
        Ok(())
    }
}

/// Counters of one buffer's traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferMetrics {
    /// Chunks delivered or filled
    pub chunks: u64,
    /// Bytes delivered or filled
    pub bytes: u64,
    /// Notify waits issued to the driver
    pub waits: u64,
}

struct StreamRegisters {
    user_len: Register,
    user_pos: Register,
    card_len: Register,
    wait: i64,
}

impl StreamRegisters {
    fn of(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Data => Self {
                user_len: registers::DATA_AVAIL_USER_LEN,
                user_pos: registers::DATA_AVAIL_USER_POS,
                card_len: registers::DATA_AVAIL_CARD_LEN,
                wait: command::DATA_WAIT_DMA,
            },
            BufferKind::Timestamp => Self {
                user_len: registers::TS_AVAIL_USER_LEN,
                user_pos: registers::TS_AVAIL_USER_POS,
                card_len: registers::TS_AVAIL_CARD_LEN,
                wait: command::EXTRA_WAIT_DMA,
            },
        }
    }
}

/// Fixed-capacity ring shared with the driver
pub struct TransferBuffer {
    spec: BufferSpec,
    memory: HostMemory,
    regs: StreamRegisters,
    /// Host cursor in bytes
    head: usize,
    /// Bytes the host may touch, as last reported by the card
    available: usize,
    /// Card-to-host bytes handed out but not yet released
    pending: usize,
    metrics: TransferMetrics,
}

impl TransferBuffer {
    /// Allocate zeroed host memory for `spec`
    pub fn allocate(spec: BufferSpec) -> CardResult<Self> {
        spec.validate()?;
        let available = match spec.direction {
            BufferDirection::CardToHost => 0,
            BufferDirection::HostToCard => spec.capacity_bytes,
        };
        debug!(
            kind = ?spec.kind,
            direction = ?spec.direction,
            capacity = spec.capacity_bytes,
            notify = spec.notify_bytes,
            "allocated transfer buffer"
        );
        Ok(Self {
            memory: HostMemory::new(spec.capacity_bytes),
            regs: StreamRegisters::of(spec.kind),
            spec,
            head: 0,
            available,
            pending: 0,
            metrics: TransferMetrics::default(),
        })
    }

    /// Bind the memory to the card stream
    pub fn attach(&self, io: &dyn RegisterInterface) -> CardResult<()> {
        io.define_transfer(TransferDefinition {
            kind: self.spec.kind,
            direction: self.spec.direction,
            notify_bytes: self.spec.notify_bytes,
            memory: self.memory.clone(),
        })
        .during("define transfer")
    }

    /// Unbind the memory from the card stream
    pub fn detach(&self, io: &dyn RegisterInterface) -> CardResult<()> {
        io.invalidate_transfer(self.spec.kind).during("invalidate transfer")
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn kind(&self) -> BufferKind {
        self.spec.kind
    }

    pub fn direction(&self) -> BufferDirection {
        self.spec.direction
    }

    pub fn capacity_bytes(&self) -> usize {
        self.spec.capacity_bytes
    }

    pub fn notify_bytes(&self) -> usize {
        self.spec.notify_bytes
    }

    pub fn metrics(&self) -> TransferMetrics {
        self.metrics
    }

    // Bytes currently owned by the consumer side's producer
    fn filled(&self) -> usize {
        match self.spec.direction {
            BufferDirection::CardToHost => self.available,
            BufferDirection::HostToCard => self.spec.capacity_bytes - self.available,
        }
    }

    /// Bytes the host may read or write, as last reported
    pub fn available_bytes(&self) -> usize {
        self.available - self.pending
    }

    /// No room left for the producer, as last reported
    pub fn is_full(&self) -> bool {
        self.filled() == self.spec.capacity_bytes
    }

    /// Nothing waiting for the consumer, as last reported
    pub fn is_empty(&self) -> bool {
        self.filled() == 0
    }

    /// Fraction of the ring in use, 0.0 to 1.0
    pub fn utilization(&self) -> f32 {
        self.filled() as f32 / self.spec.capacity_bytes as f32
    }

    fn require(&self, direction: BufferDirection, operation: &str) -> CardResult<()> {
        if self.spec.direction == direction {
            Ok(())
        } else {
            Err(CardError::config(
                ConfigRule::TransferDirection,
                format!("{} needs a {:?} buffer", operation, direction),
            ))
        }
    }

    // Block in the driver until it signals progress, then refresh the view
    fn wait_and_refresh(&mut self, io: &dyn RegisterInterface) -> CardResult<()> {
        trace!(kind = ?self.spec.kind, "waiting for notify");
        self.metrics.waits += 1;
        io.write(registers::CARD_COMMAND, self.regs.wait)
            .during("notify wait")?;
        self.refresh(io)
    }

    fn refresh(&mut self, io: &dyn RegisterInterface) -> CardResult<()> {
        let len = io.read(self.regs.user_len).on_register(self.regs.user_len)?;
        self.available = usize::try_from(len).unwrap_or(0).min(self.spec.capacity_bytes);
        Ok(())
    }

    /// Wait for the next notify chunk from the card and return it
    ///
    /// A chunk crossing the end of the ring is returned as one contiguous
    /// block. The space stays owned by the host until
    /// [`release_consumed`](Self::release_consumed).
    pub fn advance_after_notify(&mut self, io: &dyn RegisterInterface) -> CardResult<Vec<i16>> {
        self.require(BufferDirection::CardToHost, "advance_after_notify")?;
        let notify = self.spec.notify_bytes;
        while self.available.saturating_sub(self.pending) < notify {
            self.wait_and_refresh(io)?;
        }
        let bytes = self.memory.read_wrapping(self.head, notify);
        self.head = (self.head + notify) % self.spec.capacity_bytes;
        self.pending += notify;
        self.metrics.chunks += 1;
        self.metrics.bytes += notify as u64;
        trace!(head = self.head, pending = self.pending, "notify chunk delivered");
        Ok(bytes_to_samples(&bytes))
    }

    /// Return every delivered chunk's space to the card
    pub fn release_consumed(&mut self, io: &dyn RegisterInterface) -> CardResult<()> {
        if self.pending == 0 {
            return Ok(());
        }
        io.write(self.regs.card_len, self.pending as i64)
            .on_register(self.regs.card_len)?;
        self.available -= self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Write `samples` once the card has freed enough space
    pub fn fill_after_notify(&mut self, io: &dyn RegisterInterface, samples: &[i16]) -> CardResult<()> {
        self.require(BufferDirection::HostToCard, "fill_after_notify")?;
        let bytes = samples_to_bytes(samples);
        self.check_fits(bytes.len())?;
        while self.available < bytes.len() {
            self.wait_and_refresh(io)?;
        }
        self.write_at_head(io, &bytes)
    }

    /// Write `samples` before the run starts, without waiting
    pub fn preload(&mut self, io: &dyn RegisterInterface, samples: &[i16]) -> CardResult<()> {
        self.require(BufferDirection::HostToCard, "preload")?;
        let bytes = samples_to_bytes(samples);
        self.check_fits(bytes.len())?;
        if bytes.len() > self.available {
            return Err(CardError::config(
                ConfigRule::BufferCapacity,
                format!("{} bytes do not fit the {} free bytes", bytes.len(), self.available),
            ));
        }
        self.write_at_head(io, &bytes)
    }

    fn check_fits(&self, len: usize) -> CardResult<()> {
        if len > self.spec.capacity_bytes {
            return Err(CardError::config(
                ConfigRule::BufferCapacity,
                format!("{} bytes exceed the {}-byte buffer", len, self.spec.capacity_bytes),
            ));
        }
        Ok(())
    }

    fn write_at_head(&mut self, io: &dyn RegisterInterface, bytes: &[u8]) -> CardResult<()> {
        self.memory.write_wrapping(self.head, bytes);
        io.write(self.regs.card_len, bytes.len() as i64)
            .on_register(self.regs.card_len)?;
        self.head = (self.head + bytes.len()) % self.spec.capacity_bytes;
        self.available -= bytes.len();
        self.metrics.chunks += 1;
        self.metrics.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Take up to `max` bytes the card has written, without waiting
    ///
    /// Used for polled streams. A read never crosses the end of the ring;
    /// the remainder arrives on the next poll.
    pub fn poll_bytes(&mut self, io: &dyn RegisterInterface, max: usize) -> CardResult<Vec<u8>> {
        self.require(BufferDirection::CardToHost, "poll_bytes")?;
        self.refresh(io)?;
        let pos = io.read(self.regs.user_pos).on_register(self.regs.user_pos)?;
        let pos = usize::try_from(pos).unwrap_or(0) % self.spec.capacity_bytes;
        let count = self.available.min(max).min(self.spec.capacity_bytes - pos);
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.memory.read_wrapping(pos, count);
        io.write(self.regs.card_len, count as i64)
            .on_register(self.regs.card_len)?;
        self.head = (pos + count) % self.spec.capacity_bytes;
        self.available -= count;
        self.metrics.bytes += count as u64;
        Ok(bytes)
    }

    /// Whole contents of a single-transfer buffer as samples
    pub fn contents(&self) -> Vec<i16> {
        bytes_to_samples(&self.memory.read_wrapping(0, self.spec.capacity_bytes))
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("spec", &self.spec)
            .field("head", &self.head)
            .field("available", &self.available)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hal::{FaultCode, HalResult};
    use parking_lot::Mutex;

    #[test]
    fn test_notify_legality() {
        let spec = |capacity, notify| BufferSpec::new(BufferKind::Data, BufferDirection::CardToHost, capacity, notify);
        assert!(spec(4 * 4096, 4096).validate().is_ok());
        assert!(spec(8192, 512).validate().is_ok());
        assert!(spec(3200, 3200).validate().is_ok());
        assert_eq!(spec(8192, 3000).validate().unwrap_err().rule(), Some(ConfigRule::NotifyGranularity));
        assert_eq!(spec(4096, 0).validate().unwrap_err().rule(), Some(ConfigRule::NotifyGranularity));
        assert_eq!(spec(6144, 4096).validate().unwrap_err().rule(), Some(ConfigRule::BufferCapacity));
        assert_eq!(spec(0, 0).validate().unwrap_err().rule(), Some(ConfigRule::BufferCapacity));
    }

    #[test]
    fn test_timestamp_direction() {
        let spec = BufferSpec::single_transfer(BufferKind::Timestamp, BufferDirection::HostToCard, 4096);
        assert_eq!(spec.validate().unwrap_err().rule(), Some(ConfigRule::TransferDirection));
    }

    #[test]
    fn test_default_streaming_sizing() {
        let config = TransferConfig::default();
        let spec = BufferSpec::streaming(BufferDirection::CardToHost, 3200, &config);
        assert_eq!(spec.notify_bytes, 10 * 4096);
        assert_eq!(spec.capacity_bytes % spec.notify_bytes, 0);
        assert!(spec.capacity_bytes >= 3200 * 1000);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_fresh_buffer_state() {
        let acquire = TransferBuffer::allocate(BufferSpec::new(
            BufferKind::Data,
            BufferDirection::CardToHost,
            8192,
            4096,
        ))
        .unwrap();
        assert!(acquire.is_empty());
        assert!(!acquire.is_full());

        let generate = TransferBuffer::allocate(BufferSpec::single_transfer(
            BufferKind::Data,
            BufferDirection::HostToCard,
            128,
        ))
        .unwrap();
        assert!(generate.is_empty());
        assert_eq!(generate.utilization(), 0.0);
    }

    /// Card that produces one notify chunk per wait and overruns when the ring is full
    struct ProducingCard {
        capacity: i64,
        notify: i64,
        filled: Mutex<i64>,
    }

    impl ProducingCard {
        fn new(capacity: usize, notify: usize) -> Self {
            Self {
                capacity: capacity as i64,
                notify: notify as i64,
                filled: Mutex::new(0),
            }
        }
    }

    impl RegisterInterface for ProducingCard {
        fn read(&self, register: Register) -> HalResult<i64> {
            if register == registers::DATA_AVAIL_USER_LEN {
                return Ok(*self.filled.lock());
            }
            Ok(0)
        }

        fn write(&self, register: Register, value: i64) -> HalResult<()> {
            let mut filled = self.filled.lock();
            if register == registers::CARD_COMMAND && value & command::DATA_WAIT_DMA != 0 {
                if *filled + self.notify > self.capacity {
                    return Err(FaultCode::FIFO_HW_OVERRUN);
                }
                *filled += self.notify;
            } else if register == registers::DATA_AVAIL_CARD_LEN {
                *filled -= value;
            }
            Ok(())
        }

        fn define_transfer(&self, _definition: TransferDefinition) -> HalResult<()> {
            Ok(())
        }

        fn invalidate_transfer(&self, _kind: BufferKind) -> HalResult<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn ring(capacity: usize, notify: usize) -> TransferBuffer {
        TransferBuffer::allocate(BufferSpec::new(
            BufferKind::Data,
            BufferDirection::CardToHost,
            capacity,
            notify,
        ))
        .unwrap()
    }

    #[test]
    fn test_unreleased_ring_overruns_after_capacity() {
        let card = ProducingCard::new(16_384, 4096);
        let mut buffer = ring(16_384, 4096);
        for _ in 0..16_384 / 4096 {
            assert_eq!(buffer.advance_after_notify(&card).unwrap().len(), 2048);
        }
        assert!(buffer.is_full());
        let err = buffer.advance_after_notify(&card).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamOverrun);
    }

    #[test]
    fn test_released_ring_keeps_streaming() {
        let card = ProducingCard::new(16_384, 4096);
        let mut buffer = ring(16_384, 4096);
        for _ in 0..4 {
            buffer.advance_after_notify(&card).unwrap();
        }
        buffer.release_consumed(&card).unwrap();
        assert!(buffer.is_empty());
        for _ in 0..4 {
            buffer.advance_after_notify(&card).unwrap();
        }
        assert_eq!(buffer.metrics().chunks, 8);
    }

    #[cfg(feature = "simulation")]
    #[test]
    fn test_direction_checked_before_io() {
        use crate::config::MockConfig;
        use crate::hal::mock::MockDriver;
        use crate::hal::Driver;

        let driver = MockDriver::new();
        let address = driver.add_digitiser(MockConfig::default());
        let io = driver.open(&address).unwrap();
        let mut buffer = TransferBuffer::allocate(BufferSpec::single_transfer(
            BufferKind::Data,
            BufferDirection::CardToHost,
            64,
        ))
        .unwrap();
        let err = buffer.preload(io.as_ref(), &[0; 8]).unwrap_err();
        assert_eq!(err.rule(), Some(ConfigRule::TransferDirection));
    }
}
