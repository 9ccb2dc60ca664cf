// src/device/mod.rs
//! Card lifecycle and the workflows built on it
//!
//! Every concrete card wraps a [`CardCore`] and adds its own settings and
//! buffers. Capabilities are split into small traits so that a [`StarHub`]
//! can offer the same surface by delegating to its children.

pub mod awg;
pub mod card;
pub mod digitiser;
pub mod pulse_generator;
pub mod registry;
pub mod star_hub;

pub use awg::Awg;
pub use card::CardCore;
pub use digitiser::Digitiser;
pub use pulse_generator::PulseGenerator;
pub use registry::{is_claimed, library_refcount, DriverLease};
pub use star_hub::StarHub;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::acquisition::Measurement;
use crate::error::CardResult;
use crate::settings::TriggerSettings;

/// Lifecycle of one card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// No handle held
    Disconnected,
    /// Connected, nothing configured
    Idle,
    /// Settings applied, ready to start
    Configured,
    /// Started and not yet stopped
    Running,
    /// Stopped after a run; buffers kept
    Stopped,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Idle => "idle",
            DeviceState::Configured => "configured",
            DeviceState::Running => "running",
            DeviceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Stop signal checked by streaming loops between notify waits
///
/// Child tokens observe their parent's cancellation but cancelling a child
/// leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled together with `self`
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.load(Ordering::Acquire))
    }
}

/// Access to the shared core of a concrete card
pub trait Card {
    fn core(&self) -> &CardCore;

    fn core_mut(&mut self) -> &mut CardCore;

    /// Stop if running and release buffers, the handle and the address claim
    fn disconnect(&mut self) -> CardResult<()> {
        self.core_mut().disconnect()
    }
}

/// Accepts mode-level settings
pub trait Configurable {
    /// Settings object consumed by `configure`
    type Settings: Clone + Send + Sync;

    /// Run every rule without touching the card
    fn validate_settings(&self, settings: &Self::Settings, trigger: &TriggerSettings) -> CardResult<()>;

    /// Validate, then write the settings and prepare buffers
    fn configure(&mut self, settings: &Self::Settings, trigger: &TriggerSettings) -> CardResult<()>;
}

/// Runs and stops
pub trait Startable {
    fn state(&self) -> DeviceState;

    /// Configured or Stopped to Running
    fn start(&mut self) -> CardResult<()>;

    /// Running to Stopped
    fn stop(&mut self) -> CardResult<()>;
}

/// FIFO acquisition
pub trait Streamable: Startable {
    /// Measurements returned by one [`next_measurements`](Self::next_measurements)
    fn batch_size(&self) -> usize;

    /// Start, collect exactly `count` measurements, then stop
    fn execute_finite_fifo_acquisition(&mut self, count: usize) -> CardResult<Vec<Measurement>>;

    /// Start and return; measurements are pulled with `next_measurements`
    fn execute_continuous_fifo_acquisition(&mut self) -> CardResult<()>;

    /// Block until one batch is available or `cancel` fires
    fn next_measurements(&mut self, cancel: &CancellationToken) -> CardResult<Vec<Measurement>>;
}
