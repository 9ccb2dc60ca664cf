// src/hal/mock.rs
//! Simulated cards behind the register interface
//!
//! A [`MockDriver`] hosts any number of [`MockCard`]s. Each card keeps a
//! register file, runs a worker thread while started, and moves samples
//! through the host memory bound with `define_transfer` exactly like the
//! driver does: the host reads `*_AVAIL_USER_LEN`/`*_AVAIL_USER_POS`, blocks
//! on wait commands, and hands space back through `*_AVAIL_CARD_LEN`.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::registers::{self, card_mode, command, features, function_type, pulsegen, status, timestamp, trigger_mask};
use super::traits::{Driver, RegisterInterface, WaveformSource};
use super::types::{
    bytes_to_samples, samples_to_bytes, BufferDirection, BufferKind, DeviceAddress, FaultCode, HalResult,
    HostMemory, TransferDefinition,
};
use super::waveform_source::UniformNoiseSource;
use super::Register;
use crate::config::MockConfig;

const TIMESTAMP_BYTES: usize = 16;
const STAGING_LIMIT_BYTES: usize = 1 << 24;
const MIN_CHUNK_PERIOD: Duration = Duration::from_millis(1);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// What a simulated card pretends to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCardKind {
    /// Analog input card
    Digitiser,
    /// Analog output card
    Awg,
}

/// Condition on which an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTrigger {
    /// Any write to this register
    Write(Register),
    /// A card command containing any of these bits
    Command(i64),
}

impl FaultTrigger {
    fn matches(&self, register: Register, value: i64) -> bool {
        match *self {
            FaultTrigger::Write(target) => target == register,
            FaultTrigger::Command(bits) => register == registers::CARD_COMMAND && value & bits != 0,
        }
    }
}

/// Driver that serves simulated cards
pub struct MockDriver {
    instance: u64,
    cards: Mutex<Vec<Arc<MockCard>>>,
}

impl MockDriver {
    /// Empty driver with a process-unique address prefix
    pub fn new() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            cards: Mutex::new(Vec::new()),
        }
    }

    /// Add a digitiser producing uniform noise
    pub fn add_digitiser(&self, config: MockConfig) -> DeviceAddress {
        let source = Box::new(UniformNoiseSource::new(config.noise_amplitude));
        self.add_card(MockCardKind::Digitiser, config, source)
    }

    /// Add an AWG
    pub fn add_awg(&self, config: MockConfig) -> DeviceAddress {
        let source = Box::new(UniformNoiseSource::new(0));
        self.add_card(MockCardKind::Awg, config, source)
    }

    /// Add a card with an explicit sample source
    pub fn add_card(
        &self,
        kind: MockCardKind,
        config: MockConfig,
        source: Box<dyn WaveformSource>,
    ) -> DeviceAddress {
        let mut cards = self.cards.lock();
        let address = DeviceAddress::new(format!("/mock{}/dev/spcm{}", self.instance, cards.len()));
        debug!(%address, ?kind, "adding simulated card");
        cards.push(Arc::new(MockCard::new(address.clone(), kind, config, source)));
        address
    }

    /// Simulated card behind an address, for inspection and stimulus
    pub fn card(&self, address: &DeviceAddress) -> Option<Arc<MockCard>> {
        self.cards.lock().iter().find(|c| &c.address == address).cloned()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn open(&self, address: &DeviceAddress) -> HalResult<Arc<dyn RegisterInterface>> {
        let card = self.card(address).ok_or(FaultCode::BOARD_NOT_FOUND)?;
        {
            let mut state = card.shared.state.lock();
            if state.claimed_elsewhere {
                return Err(FaultCode::BOARD_IN_USE);
            }
            state.open_handles += 1;
        }
        Ok(Arc::new(MockHandle {
            card,
            open: AtomicBool::new(true),
        }))
    }
}

struct MockHandle {
    card: Arc<MockCard>,
    open: AtomicBool,
}

impl MockHandle {
    fn check_open(&self) -> HalResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FaultCode::INVALID_HANDLE)
        }
    }
}

impl RegisterInterface for MockHandle {
    fn read(&self, register: Register) -> HalResult<i64> {
        self.check_open()?;
        self.card.read(register)
    }

    fn write(&self, register: Register, value: i64) -> HalResult<()> {
        self.check_open()?;
        self.card.write(register, value)
    }

    fn define_transfer(&self, definition: TransferDefinition) -> HalResult<()> {
        self.check_open()?;
        self.card.define_transfer(definition)
    }

    fn invalidate_transfer(&self, kind: BufferKind) -> HalResult<()> {
        self.check_open()?;
        let mut state = self.card.shared.state.lock();
        *state.stream_slot(kind) = None;
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.card.handle_closed();
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Stream {
    direction: BufferDirection,
    notify_bytes: usize,
    memory: HostMemory,
    user_pos: usize,
    user_len: usize,
    observed_len: usize,
    dma_active: bool,
}

impl Stream {
    fn new(definition: TransferDefinition) -> Self {
        let user_len = match definition.direction {
            BufferDirection::CardToHost => 0,
            BufferDirection::HostToCard => definition.memory.len(),
        };
        Self {
            direction: definition.direction,
            notify_bytes: definition.notify_bytes,
            memory: definition.memory,
            user_pos: 0,
            user_len,
            observed_len: user_len,
            dma_active: false,
        }
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }

    // Card side of a card-to-host stream
    fn card_write(&mut self, bytes: &[u8]) -> bool {
        if self.capacity() - self.user_len < bytes.len() {
            return false;
        }
        let start = (self.user_pos + self.user_len) % self.capacity();
        self.memory.write_wrapping(start, bytes);
        self.user_len += bytes.len();
        true
    }

    // Card side of a host-to-card stream
    fn card_read(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.capacity() - self.user_len < count {
            return None;
        }
        let start = (self.user_pos + self.user_len) % self.capacity();
        let data = self.memory.read_wrapping(start, count);
        self.user_len += count;
        Some(data)
    }

    fn host_release(&mut self, count: usize) -> HalResult<()> {
        if count > self.user_len {
            return Err(FaultCode::VALUE);
        }
        self.user_len -= count;
        self.user_pos = (self.user_pos + count) % self.capacity();
        self.observed_len = self.observed_len.saturating_sub(count);
        Ok(())
    }
}

struct CardState {
    registers: HashMap<u32, i64>,
    data: Option<Stream>,
    timestamps: Option<Stream>,
    staging: Vec<u8>,
    onboard: Vec<u8>,
    running: bool,
    stop_requested: bool,
    ready: bool,
    triggered: bool,
    overrun: bool,
    pending_triggers: u64,
    timestamp_origin: Instant,
    worker: Option<JoinHandle<()>>,
    injected: Vec<(FaultTrigger, FaultCode)>,
    write_log: Vec<(Register, i64)>,
    claimed_elsewhere: bool,
    open_handles: usize,
}

impl CardState {
    fn register(&self, register: Register) -> i64 {
        self.registers.get(&register.address()).copied().unwrap_or(0)
    }

    fn stream_slot(&mut self, kind: BufferKind) -> &mut Option<Stream> {
        match kind {
            BufferKind::Data => &mut self.data,
            BufferKind::Timestamp => &mut self.timestamps,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self.register(registers::TIMEOUT) {
            ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        }
    }

    fn status_bits(&self) -> i64 {
        let mut bits = 0;
        if self.ready {
            bits |= status::READY;
        }
        if self.triggered {
            bits |= status::TRIGGER;
        } else if self.running {
            bits |= status::PRETRIGGER;
        }
        if self.overrun {
            bits |= status::DATA_OVERRUN;
        }
        if let Some(data) = &self.data {
            if data.direction == BufferDirection::CardToHost && data.user_len >= data.notify_bytes {
                bits |= status::DATA_BLOCK_READY;
            }
        }
        if let Some(ts) = &self.timestamps {
            if ts.user_len >= TIMESTAMP_BYTES {
                bits |= status::EXTRA_BLOCK_READY;
            }
        }
        i64::from(bits)
    }

    // Stage FIFO bytes and move whole notify chunks to the host. False on overrun.
    fn push_fifo(&mut self, bytes: &[u8]) -> bool {
        self.staging.extend_from_slice(bytes);
        let stream = match self.data.as_mut() {
            Some(stream) if stream.dma_active => stream,
            _ => return self.staging.len() <= STAGING_LIMIT_BYTES,
        };
        while self.staging.len() >= stream.notify_bytes {
            let chunk: Vec<u8> = self.staging.drain(..stream.notify_bytes).collect();
            if !stream.card_write(&chunk) {
                return false;
            }
        }
        true
    }

    fn stamp(&mut self, sample_rate: f64) {
        let ticks = (self.timestamp_origin.elapsed().as_secs_f64() * sample_rate) as u64;
        if let Some(ts) = self.timestamps.as_mut() {
            let mut bytes = [0u8; TIMESTAMP_BYTES];
            bytes[..8].copy_from_slice(&ticks.to_le_bytes());
            if !ts.card_write(&bytes) {
                trace!("timestamp buffer full, stamp dropped");
            }
        }
    }
}

struct Shared {
    state: Mutex<CardState>,
    signal: Condvar,
    source: Mutex<Box<dyn WaveformSource>>,
}

/// One simulated card
pub struct MockCard {
    address: DeviceAddress,
    kind: MockCardKind,
    config: MockConfig,
    known: HashSet<u32>,
    shared: Arc<Shared>,
}

impl MockCard {
    fn new(
        address: DeviceAddress,
        kind: MockCardKind,
        config: MockConfig,
        source: Box<dyn WaveformSource>,
    ) -> Self {
        let state = CardState {
            registers: default_registers(kind, &config),
            data: None,
            timestamps: None,
            staging: Vec::new(),
            onboard: Vec::new(),
            running: false,
            stop_requested: false,
            ready: false,
            triggered: false,
            overrun: false,
            pending_triggers: 0,
            timestamp_origin: Instant::now(),
            worker: None,
            injected: Vec::new(),
            write_log: Vec::new(),
            claimed_elsewhere: false,
            open_handles: 0,
        };
        Self {
            address,
            kind,
            config,
            known: registers::catalogue().map(|r| r.address()).collect(),
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                signal: Condvar::new(),
                source: Mutex::new(source),
            }),
        }
    }

    /// Driver address of this card
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Card kind
    pub fn kind(&self) -> MockCardKind {
        self.kind
    }

    /// Every register write seen so far, in order
    pub fn write_log(&self) -> Vec<(Register, i64)> {
        self.shared.state.lock().write_log.clone()
    }

    /// Values written to the command register, in order
    pub fn commands(&self) -> Vec<i64> {
        self.shared
            .state
            .lock()
            .write_log
            .iter()
            .filter(|(r, _)| *r == registers::CARD_COMMAND)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Forget the write log
    pub fn clear_write_log(&self) {
        self.shared.state.lock().write_log.clear();
    }

    /// Current register content without read side effects
    pub fn peek(&self, register: Register) -> i64 {
        self.shared.state.lock().register(register)
    }

    /// Fail the next write matching `trigger` with `code`
    pub fn inject_fault(&self, trigger: FaultTrigger, code: FaultCode) {
        self.shared.state.lock().injected.push((trigger, code));
    }

    /// Deliver one trigger event on an external or channel source
    pub fn fire_external_trigger(&self) {
        let mut state = self.shared.state.lock();
        state.pending_triggers += 1;
        self.shared.signal.notify_all();
    }

    /// Pretend another process holds the card
    pub fn set_claimed_elsewhere(&self, claimed: bool) {
        self.shared.state.lock().claimed_elsewhere = claimed;
    }

    /// Worker thread active
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.shared.state.lock().open_handles
    }

    /// Host memory currently bound to the `kind` stream
    pub fn has_transfer(&self, kind: BufferKind) -> bool {
        self.shared.state.lock().stream_slot(kind).is_some()
    }

    /// Samples held in on-board memory (acquired record or loaded waveform)
    pub fn onboard_samples(&self) -> Vec<i16> {
        bytes_to_samples(&self.shared.state.lock().onboard)
    }

    fn read(&self, register: Register) -> HalResult<i64> {
        if !self.known.contains(&register.address()) {
            return Err(FaultCode::REGISTER);
        }
        if !register.is_readable() {
            return Err(FaultCode::NO_ACCESS);
        }
        let mut state = self.shared.state.lock();
        let value = if register == registers::CARD_STATUS {
            state.status_bits()
        } else if let Some((kind, field)) = avail_register(register) {
            let stream = state.stream_slot(kind).as_mut().ok_or(FaultCode::SEQUENCE)?;
            match field {
                AvailField::UserLen => {
                    stream.observed_len = stream.user_len;
                    stream.user_len as i64
                }
                AvailField::UserPos => stream.user_pos as i64,
            }
        } else {
            state.register(register)
        };
        trace!(card = %self.address, %register, value, "mock read");
        Ok(value)
    }

    fn write(&self, register: Register, value: i64) -> HalResult<()> {
        if !self.known.contains(&register.address()) {
            return Err(FaultCode::REGISTER);
        }
        if !register.is_writable() {
            return Err(FaultCode::NO_WRITE_ALLOWED);
        }
        if !register.fits(value) {
            return Err(FaultCode::VALUE);
        }
        {
            let mut state = self.shared.state.lock();
            state.write_log.push((register, value));
            if let Some(pos) = state.injected.iter().position(|(t, _)| t.matches(register, value)) {
                let (_, code) = state.injected.remove(pos);
                warn!(card = %self.address, %register, %code, "injected fault");
                return Err(code);
            }
            if register == registers::DATA_AVAIL_CARD_LEN || register == registers::TS_AVAIL_CARD_LEN {
                let kind = if register == registers::DATA_AVAIL_CARD_LEN {
                    BufferKind::Data
                } else {
                    BufferKind::Timestamp
                };
                let count = usize::try_from(value).map_err(|_| FaultCode::VALUE)?;
                state
                    .stream_slot(kind)
                    .as_mut()
                    .ok_or(FaultCode::SEQUENCE)?
                    .host_release(count)?;
                self.shared.signal.notify_all();
                return Ok(());
            }
            if register == registers::TIMESTAMP_COMMAND {
                if value & timestamp::RESET != 0 {
                    state.timestamp_origin = Instant::now();
                }
                state.registers.insert(register.address(), value & !timestamp::RESET);
                return Ok(());
            }
            if register != registers::CARD_COMMAND {
                state.registers.insert(register.address(), value);
                return Ok(());
            }
        }
        trace!(card = %self.address, command = format_args!("{value:#x}"), "mock command");
        self.execute(value)
    }

    fn define_transfer(&self, definition: TransferDefinition) -> HalResult<()> {
        if definition.memory.is_empty() {
            return Err(FaultCode::BUFFER_SIZE);
        }
        if definition.notify_bytes == 0 || definition.notify_bytes > definition.memory.len() {
            return Err(FaultCode::NOTIFY_SIZE);
        }
        let expected = match (self.kind, definition.kind) {
            (MockCardKind::Awg, BufferKind::Data) => BufferDirection::HostToCard,
            _ => BufferDirection::CardToHost,
        };
        if definition.direction != expected {
            return Err(FaultCode::DIRECTION_MISMATCH);
        }
        let kind = definition.kind;
        let mut state = self.shared.state.lock();
        *state.stream_slot(kind) = Some(Stream::new(definition));
        if kind == BufferKind::Data {
            state.staging.clear();
        }
        Ok(())
    }

    fn handle_closed(&self) {
        let remaining = {
            let mut state = self.shared.state.lock();
            state.open_handles = state.open_handles.saturating_sub(1);
            state.open_handles
        };
        if remaining == 0 {
            self.stop_worker();
            let mut state = self.shared.state.lock();
            state.data = None;
            state.timestamps = None;
        }
    }

    fn execute(&self, value: i64) -> HalResult<()> {
        if value & command::CARD_RESET != 0 {
            self.reset();
        }
        if value & command::WRITE_SETUP != 0 {
            self.write_setup()?;
        }
        if value & command::DATA_START_DMA != 0 {
            self.start_dma()?;
        }
        if value & (command::EXTRA_START_DMA | command::EXTRA_POLL) != 0 {
            let mut state = self.shared.state.lock();
            state.timestamps.as_mut().ok_or(FaultCode::SEQUENCE)?.dma_active = true;
        }
        if value & command::CARD_START != 0 {
            self.start()?;
        }
        if value & command::FORCE_TRIGGER != 0 {
            self.fire_external_trigger();
        }
        if value & command::CARD_STOP != 0 {
            self.stop_worker();
        }
        if value & command::WAIT_TRIGGER != 0 {
            self.wait_until(|s| s.triggered)?;
        }
        if value & command::WAIT_READY != 0 {
            self.wait_until(|s| s.ready)?;
        }
        if value & command::DATA_WAIT_DMA != 0 {
            self.wait_dma(BufferKind::Data)?;
        }
        if value & command::EXTRA_WAIT_DMA != 0 {
            self.wait_dma(BufferKind::Timestamp)?;
        }
        if value & command::DATA_STOP_DMA != 0 {
            if let Some(data) = self.shared.state.lock().data.as_mut() {
                data.dma_active = false;
            }
        }
        if value & command::EXTRA_STOP_DMA != 0 {
            if let Some(ts) = self.shared.state.lock().timestamps.as_mut() {
                ts.dma_active = false;
            }
        }
        Ok(())
    }

    fn reset(&self) {
        self.stop_worker();
        let mut state = self.shared.state.lock();
        state.registers = default_registers(self.kind, &self.config);
        state.data = None;
        state.timestamps = None;
        state.staging.clear();
        state.onboard.clear();
        state.ready = false;
        state.triggered = false;
        state.overrun = false;
        state.pending_triggers = 0;
        debug!(card = %self.address, "mock card reset");
    }

    fn write_setup(&self) -> HalResult<()> {
        let state = self.shared.state.lock();
        let channels = state.register(registers::CHANNEL_ENABLE).count_ones();
        if ![1, 2, 4, 8].contains(&channels) {
            return Err(FaultCode::CHANNEL);
        }
        let or = state.register(registers::TRIG_OR_MASK);
        let and = state.register(registers::TRIG_AND_MASK);
        let ch_or = state.register(registers::TRIG_CH_OR_MASK);
        let ch_and = state.register(registers::TRIG_CH_AND_MASK);
        if or & and != 0 || ch_or & ch_and != 0 {
            return Err(FaultCode::AND_OR_MASK_OVERLAP);
        }
        Ok(())
    }

    fn start_dma(&self) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        let fifo = is_fifo_mode(state.register(registers::CARD_MODE));
        let running = state.running;
        let ready = state.ready;
        let data = state.data.as_mut().ok_or(FaultCode::SEQUENCE)?;
        data.dma_active = true;
        match data.direction {
            BufferDirection::CardToHost if fifo => {
                state.push_fifo(&[]);
            }
            BufferDirection::CardToHost => {
                if !running && ready {
                    let onboard = std::mem::take(&mut state.onboard);
                    let data = state.data.as_mut().ok_or(FaultCode::SEQUENCE)?;
                    let fits = data.card_write(&onboard);
                    state.onboard = onboard;
                    if !fits {
                        return Err(FaultCode::BUFFER_SIZE);
                    }
                }
            }
            BufferDirection::HostToCard if !fifo && !running => {
                let held = data.capacity() - data.user_len;
                let waveform = data.card_read(held).unwrap_or_default();
                state.onboard = waveform;
            }
            BufferDirection::HostToCard => {}
        }
        self.shared.signal.notify_all();
        Ok(())
    }

    fn start(&self) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(FaultCode::RUNNING);
        }
        let plan = RunPlan::from_registers(self.kind, &self.config, &state)?;
        state.ready = false;
        state.triggered = false;
        state.overrun = false;
        state.stop_requested = false;
        state.staging.clear();
        if self.kind == MockCardKind::Digitiser {
            state.onboard.clear();
        }
        state.running = true;
        let shared = Arc::clone(&self.shared);
        let name = format!("mock-{}", self.address);
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || match plan.kind {
                MockCardKind::Digitiser => run_digitiser(&shared, &plan),
                MockCardKind::Awg => run_awg(&shared, &plan),
            })
            .map_err(|_| FaultCode::INTERNAL)?;
        state.worker = Some(worker);
        debug!(card = %self.address, "mock card started");
        Ok(())
    }

    fn stop_worker(&self) {
        let worker = {
            let mut state = self.shared.state.lock();
            state.stop_requested = true;
            self.shared.signal.notify_all();
            state.worker.take()
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(card = %self.address, "mock worker panicked");
            }
        }
        let mut state = self.shared.state.lock();
        state.stop_requested = false;
        state.running = false;
        self.shared.signal.notify_all();
    }

    fn wait_until(&self, condition: impl Fn(&CardState) -> bool) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        let deadline = state.timeout().map(|t| Instant::now() + t);
        loop {
            if condition(&state) {
                return Ok(());
            }
            if !state.running {
                return Err(FaultCode::ABORT);
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.signal.wait_until(&mut state, deadline).timed_out() && !condition(&state) {
                        return Err(FaultCode::TIMEOUT);
                    }
                }
                None => self.shared.signal.wait(&mut state),
            }
        }
    }

    fn wait_dma(&self, kind: BufferKind) -> HalResult<()> {
        let mut state = self.shared.state.lock();
        let deadline = state.timeout().map(|t| Instant::now() + t);
        loop {
            if kind == BufferKind::Data && state.overrun {
                return Err(FaultCode::FIFO_HW_OVERRUN);
            }
            let running = state.running;
            let stream = state.stream_slot(kind).as_ref().ok_or(FaultCode::SEQUENCE)?;
            if stream.user_len > stream.observed_len {
                return Ok(());
            }
            if !running {
                return Err(FaultCode::ABORT);
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.signal.wait_until(&mut state, deadline).timed_out() {
                        let stream = state.stream_slot(kind).as_ref().ok_or(FaultCode::SEQUENCE)?;
                        if stream.user_len > stream.observed_len {
                            return Ok(());
                        }
                        return Err(FaultCode::TIMEOUT);
                    }
                }
                None => self.shared.signal.wait(&mut state),
            }
        }
    }
}

enum AvailField {
    UserLen,
    UserPos,
}

fn avail_register(register: Register) -> Option<(BufferKind, AvailField)> {
    if register == registers::DATA_AVAIL_USER_LEN {
        Some((BufferKind::Data, AvailField::UserLen))
    } else if register == registers::DATA_AVAIL_USER_POS {
        Some((BufferKind::Data, AvailField::UserPos))
    } else if register == registers::TS_AVAIL_USER_LEN {
        Some((BufferKind::Timestamp, AvailField::UserLen))
    } else if register == registers::TS_AVAIL_USER_POS {
        Some((BufferKind::Timestamp, AvailField::UserPos))
    } else {
        None
    }
}

fn is_fifo_mode(mode: i64) -> bool {
    matches!(
        mode,
        card_mode::FIFO_MULTI | card_mode::FIFO_AVERAGE | card_mode::REP_FIFO_SINGLE
    )
}

fn default_registers(kind: MockCardKind, config: &MockConfig) -> HashMap<u32, i64> {
    let function = match kind {
        MockCardKind::Digitiser => function_type::ANALOG_IN,
        MockCardKind::Awg => function_type::ANALOG_OUT,
    };
    let mode = match kind {
        MockCardKind::Digitiser => card_mode::STD_SINGLE,
        MockCardKind::Awg => card_mode::REP_STD_SINGLE,
    };
    let mut values = vec![
        (registers::MODULES, i64::from(config.modules)),
        (registers::CHANNELS_PER_MODULE, i64::from(config.channels_per_module)),
        (registers::BYTES_PER_SAMPLE, 2),
        (registers::MAX_ADC_VALUE, config.max_adc_value),
        (registers::CARD_TYPE, config.card_type),
        (registers::FUNCTION_TYPE, function),
        (registers::SERIAL_NUMBER, config.serial_number),
        (
            registers::FEATURES,
            features::MULTI | features::TIMESTAMP | features::STARHUB | features::BASE_XIO,
        ),
        (
            registers::EXT_FEATURES,
            if config.pulse_generators { features::EXT_PULSE_GENERATOR } else { 0 },
        ),
        (registers::PRETRIGGER_LIMIT, config.pretrigger_limit_samples),
        (registers::MEMORY_STEP, config.memory_step_samples),
        (registers::CARD_MODE, mode),
        (registers::MEMORY_SIZE, 1000),
        (registers::SEGMENT_SIZE, 1000),
        (registers::POST_TRIGGER, 1000),
        (registers::CHANNEL_ENABLE, 1),
        (registers::SAMPLE_RATE, 1_000_000),
        (registers::TIMEOUT, config.timeout_ms),
        (registers::TRIG_OR_MASK, trigger_mask::SOFTWARE),
        (registers::PULSEGEN_CLOCK, config.pulse_generator_clock_hz),
        (registers::PULSEGEN_LEN_MIN, 2),
        (registers::PULSEGEN_LEN_MAX, 1_000_000),
        (registers::PULSEGEN_LEN_STEP, 2),
        (registers::PULSEGEN_HIGH_MIN, 1),
        (registers::PULSEGEN_HIGH_MAX, 500_000),
        (registers::PULSEGEN_HIGH_STEP, 1),
        (registers::PULSEGEN_DELAY_MIN, 0),
        (registers::PULSEGEN_DELAY_MAX, 1_000_000),
        (registers::PULSEGEN_DELAY_STEP, 1),
        (registers::PULSEGEN_LOOPS_MIN, 0),
        (registers::PULSEGEN_LOOPS_MAX, 1000),
        (registers::PULSEGEN_LOOPS_STEP, 1),
    ];
    let channels = (config.modules * config.channels_per_module) as usize;
    for channel in 0..channels {
        values.push((registers::AMPLITUDE.at(channel), 1000));
        values.push((registers::OFFSET.at(channel), 0));
    }
    for line in 0..registers::XIO_MODE.len() {
        values.push((registers::XIO_AVAIL_MODES.at(line), 0xFFFF));
        values.push((registers::PULSEGEN_MODE.at(line), pulsegen::MODE_GATED));
    }
    values.into_iter().map(|(r, v)| (r.address(), v)).collect()
}

struct RunPlan {
    kind: MockCardKind,
    fifo: bool,
    restart: bool,
    channels: usize,
    samples_per_frame: usize,
    frames: Option<u64>,
    auto_trigger: bool,
    frame_period: Duration,
    sample_rate: f64,
    timestamps: bool,
}

impl RunPlan {
    fn from_registers(kind: MockCardKind, config: &MockConfig, state: &CardState) -> HalResult<Self> {
        let mode = state.register(registers::CARD_MODE);
        let channels = state.register(registers::CHANNEL_ENABLE).count_ones().max(1) as usize;
        let segment = state.register(registers::SEGMENT_SIZE).max(1) as u64;
        let memory = state.register(registers::MEMORY_SIZE).max(1) as u64;
        let loops = state.register(registers::LOOPS).max(0) as u64;
        let finite_loops = (loops > 0).then_some(loops);
        let (fifo, restart, samples, frames) = match (kind, mode) {
            (MockCardKind::Digitiser, card_mode::STD_SINGLE) => (false, false, memory, Some(1)),
            (MockCardKind::Digitiser, card_mode::STD_MULTI | card_mode::STD_AVERAGE) => {
                (false, false, segment, Some((memory / segment).max(1)))
            }
            (MockCardKind::Digitiser, card_mode::FIFO_MULTI | card_mode::FIFO_AVERAGE) => {
                (true, false, segment, finite_loops)
            }
            (MockCardKind::Awg, card_mode::REP_STD_SINGLE) => (false, false, memory, finite_loops),
            (MockCardKind::Awg, card_mode::REP_STD_SINGLE_RESTART) => (false, true, memory, finite_loops),
            (MockCardKind::Awg, card_mode::REP_FIFO_SINGLE) => (true, false, memory, finite_loops),
            _ => return Err(FaultCode::SETUP),
        };
        let masks = [
            registers::TRIG_OR_MASK,
            registers::TRIG_AND_MASK,
            registers::TRIG_CH_OR_MASK,
            registers::TRIG_CH_AND_MASK,
        ];
        let no_sources = masks.iter().all(|m| state.register(*m) == 0);
        let auto_trigger = state.register(registers::TRIG_OR_MASK) & trigger_mask::SOFTWARE != 0
            || (no_sources && state.register(registers::SYNC_ENABLE_MASK) != 0);
        let frame_rate = if config.frame_rate_hz > 0.0 { config.frame_rate_hz } else { 1.0 };
        Ok(Self {
            kind,
            fifo,
            restart,
            channels,
            samples_per_frame: samples as usize,
            frames,
            auto_trigger,
            frame_period: Duration::from_secs_f64(1.0 / frame_rate),
            sample_rate: state.register(registers::SAMPLE_RATE).max(1) as f64,
            timestamps: state.register(registers::TIMESTAMP_COMMAND) & timestamp::MODE_STANDARD != 0,
        })
    }
}

impl Shared {
    // False once a stop has been requested.
    fn await_trigger(&self, plan: &RunPlan) -> bool {
        let mut state = self.state.lock();
        if plan.auto_trigger {
            let deadline = Instant::now() + plan.frame_period;
            while !state.stop_requested {
                if self.signal.wait_until(&mut state, deadline).timed_out() {
                    return !state.stop_requested;
                }
            }
            return false;
        }
        loop {
            if state.stop_requested {
                return false;
            }
            if state.pending_triggers > 0 {
                state.pending_triggers -= 1;
                return true;
            }
            self.signal.wait(&mut state);
        }
    }

    // False once a stop has been requested.
    fn pause(&self, period: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = Instant::now() + period;
        while !state.stop_requested {
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                return !state.stop_requested;
            }
        }
        false
    }

    fn finish(&self, ready: bool) {
        let mut state = self.state.lock();
        state.ready = ready;
        state.running = false;
        self.signal.notify_all();
    }
}

fn run_digitiser(shared: &Shared, plan: &RunPlan) {
    let mut produced = 0u64;
    loop {
        if plan.frames.is_some_and(|n| produced >= n) {
            break;
        }
        if !shared.await_trigger(plan) {
            break;
        }
        let block = shared.source.lock().next_block(plan.samples_per_frame, plan.channels);
        let bytes = samples_to_bytes(&block);
        let mut state = shared.state.lock();
        if state.stop_requested {
            break;
        }
        state.triggered = true;
        if plan.timestamps {
            state.stamp(plan.sample_rate);
        }
        if plan.fifo {
            if !state.push_fifo(&bytes) {
                warn!("simulated FIFO overrun");
                state.overrun = true;
                state.running = false;
                shared.signal.notify_all();
                return;
            }
        } else {
            state.onboard.extend_from_slice(&bytes);
        }
        produced += 1;
        shared.signal.notify_all();
    }
    shared.finish(plan.frames.is_some_and(|n| produced >= n));
}

fn run_awg(shared: &Shared, plan: &RunPlan) {
    let replay = Duration::from_secs_f64(plan.samples_per_frame as f64 / plan.sample_rate).max(MIN_CHUNK_PERIOD);
    if !plan.restart && !shared.await_trigger(plan) {
        shared.finish(false);
        return;
    }
    {
        let mut state = shared.state.lock();
        state.triggered = true;
        shared.signal.notify_all();
    }
    let mut replays = 0u64;
    loop {
        if plan.frames.is_some_and(|n| replays >= n) {
            break;
        }
        if plan.restart && !shared.await_trigger(plan) {
            break;
        }
        if plan.fifo {
            let mut state = shared.state.lock();
            let Some(notify) = state.data.as_ref().map(|d| d.notify_bytes) else {
                break;
            };
            let samples = notify / (2 * plan.channels);
            let period = Duration::from_secs_f64(samples as f64 / plan.sample_rate).max(MIN_CHUNK_PERIOD);
            let consumed = state.data.as_mut().and_then(|d| d.card_read(notify));
            if consumed.is_none() {
                warn!("simulated FIFO underrun");
                state.overrun = true;
                state.running = false;
                shared.signal.notify_all();
                return;
            }
            shared.signal.notify_all();
            drop(state);
            if !shared.pause(period) {
                break;
            }
        } else if !shared.pause(replay) {
            break;
        }
        replays += 1;
    }
    shared.finish(plan.frames.is_some_and(|n| replays >= n));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::waveform_source::RampSource;

    fn card_with_ramp() -> (MockDriver, DeviceAddress) {
        let driver = MockDriver::new();
        let config = MockConfig {
            frame_rate_hz: 1000.0,
            ..MockConfig::default()
        };
        let address = driver.add_card(MockCardKind::Digitiser, config, Box::new(RampSource::new()));
        (driver, address)
    }

    #[test]
    fn test_open_unknown_address_fails() {
        let driver = MockDriver::new();
        let result = driver.open(&DeviceAddress::local(99));
        assert_eq!(result.err(), Some(FaultCode::BOARD_NOT_FOUND));
    }

    #[test]
    fn test_register_access_rules() {
        let (driver, address) = card_with_ramp();
        let handle = driver.open(&address).unwrap();
        assert_eq!(handle.write(registers::CARD_STATUS, 1), Err(FaultCode::NO_WRITE_ALLOWED));
        assert_eq!(handle.read(registers::CARD_COMMAND), Err(FaultCode::NO_ACCESS));
        assert_eq!(handle.write(registers::CARD_MODE, 1 << 40), Err(FaultCode::VALUE));
        assert_eq!(handle.read(registers::MODULES), Ok(2));
        handle.close();
        assert_eq!(handle.read(registers::MODULES), Err(FaultCode::INVALID_HANDLE));
    }

    #[test]
    fn test_standard_single_acquisition_round_trip() {
        let (driver, address) = card_with_ramp();
        let handle = driver.open(&address).unwrap();
        handle.write(registers::CHANNEL_ENABLE, 0b11).unwrap();
        handle.write(registers::MEMORY_SIZE, 4).unwrap();
        handle
            .write(registers::CARD_COMMAND, command::CARD_START | command::ENABLE_TRIGGER)
            .unwrap();
        handle.write(registers::CARD_COMMAND, command::WAIT_READY).unwrap();

        let memory = HostMemory::new(16);
        handle
            .define_transfer(TransferDefinition {
                kind: BufferKind::Data,
                direction: BufferDirection::CardToHost,
                notify_bytes: 16,
                memory: memory.clone(),
            })
            .unwrap();
        handle
            .write(registers::CARD_COMMAND, command::DATA_START_DMA | command::DATA_WAIT_DMA)
            .unwrap();
        assert_eq!(handle.read(registers::DATA_AVAIL_USER_LEN), Ok(16));
        let samples = bytes_to_samples(&memory.read_wrapping(0, 16));
        assert_eq!(samples, vec![0, 1000, 1, 1001, 2, 1002, 3, 1003]);
    }

    #[test]
    fn test_wait_ready_times_out_without_trigger() {
        let (driver, address) = card_with_ramp();
        let handle = driver.open(&address).unwrap();
        handle.write(registers::TRIG_OR_MASK, trigger_mask::EXT0).unwrap();
        handle.write(registers::TIMEOUT, 20).unwrap();
        handle.write(registers::CARD_COMMAND, command::CARD_START).unwrap();
        assert_eq!(
            handle.write(registers::CARD_COMMAND, command::WAIT_READY),
            Err(FaultCode::TIMEOUT)
        );
        let card = driver.card(&address).unwrap();
        assert!(card.is_running());
        card.fire_external_trigger();
        handle.write(registers::CARD_COMMAND, command::WAIT_READY).unwrap();
        handle.write(registers::CARD_COMMAND, command::CARD_STOP).unwrap();
        assert!(!card.is_running());
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let (driver, address) = card_with_ramp();
        let card = driver.card(&address).unwrap();
        card.inject_fault(FaultTrigger::Write(registers::SAMPLE_RATE), FaultCode::BOARD_LOCKED);
        let handle = driver.open(&address).unwrap();
        assert_eq!(handle.write(registers::SAMPLE_RATE, 10), Err(FaultCode::BOARD_LOCKED));
        assert_eq!(handle.write(registers::SAMPLE_RATE, 10), Ok(()));
        assert_eq!(card.write_log().len(), 2);
    }

    #[test]
    fn test_claimed_elsewhere() {
        let (driver, address) = card_with_ramp();
        driver.card(&address).unwrap().set_claimed_elsewhere(true);
        assert_eq!(driver.open(&address).err(), Some(FaultCode::BOARD_IN_USE));
    }
}
