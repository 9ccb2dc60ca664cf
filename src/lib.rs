//! Digitiser-Core: register-level control of digitiser and AWG cards
//!
//! The crate turns typed settings into ordered register writes, moves
//! samples between card memory and host buffers, and drives the
//! acquisition and generation state machines of single cards and of
//! StarHub groups sharing one clock and trigger.
//!
//! - [`hal`]: register interface, register catalogue, fault codes and the
//!   simulated backend
//! - [`settings`]: validated trigger, acquisition, generation, I/O line and
//!   pulse generator settings
//! - [`acquisition`]: transfer buffers, frame assembly, measurements and
//!   timestamps
//! - [`device`]: card lifecycle, digitiser and AWG workflows, StarHub and
//!   pulse generators
//! - [`config`]: tunable defaults and the TOML loader
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use digitiser_core::config::{CoreConfig, MockConfig};
//! use digitiser_core::device::{Configurable, Digitiser};
//! use digitiser_core::hal::mock::MockDriver;
//! use digitiser_core::settings::{AcquisitionSettings, TriggerSettings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = MockDriver::new();
//!     let address = driver.add_digitiser(MockConfig::default());
//!     let mut digitiser = Digitiser::connect(&driver, &address, CoreConfig::default())?;
//!
//!     let settings = AcquisitionSettings::standard_single(10_000_000, 1024, &[0, 1]);
//!     digitiser.configure(&settings, &TriggerSettings::software())?;
//!     let measurement = digitiser.execute_standard_single_acquisition()?;
//!     println!("{} channels of {} samples", measurement.num_channels(), measurement.samples_per_channel());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod hal;
pub mod settings;

// Re-export commonly used types for convenience
pub use acquisition::{BufferSpec, Measurement, TransferBuffer};
pub use config::CoreConfig;
pub use device::{
    Awg, CancellationToken, Card, Configurable, DeviceState, Digitiser, PulseGenerator, StarHub, Startable,
    Streamable,
};
pub use error::{CardError, CardResult, ConfigRule, ErrorKind};
pub use hal::{DeviceAddress, Driver, FaultCode, RegisterInterface};
pub use settings::{AcquisitionSettings, GenerationSettings, TriggerSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn version_info() -> VersionInfo {
    let mut features = vec![
        "Validated settings to register writes".to_string(),
        "Notify-chunked FIFO transfer buffers".to_string(),
        "StarHub synchronised cards".to_string(),
        "Pulse generators".to_string(),
    ];
    if cfg!(feature = "simulation") {
        features.push("Simulated cards".to_string());
    }
    VersionInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: "Register-level control of digitiser and AWG cards".to_string(),
        features,
    }
}

/// Library version information
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Library name
    pub name: String,
    /// Version string
    pub version: String,
    /// Description
    pub description: String,
    /// List of features
    pub features: Vec<String>,
}
