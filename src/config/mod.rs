// src/config/mod.rs
//! Tunable defaults for transfers, timestamps, streaming and simulated cards

pub mod constants;
pub mod loader;

pub use constants::*;
pub use loader::{ConfigError, ConfigLoader};

use serde::{Deserialize, Serialize};

/// Complete core configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub timestamps: TimestampConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub mock: MockConfig,
}

/// Host transfer buffer sizing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TransferConfig {
    #[serde(default = "defaults::page_size_bytes")]
    pub page_size_bytes: usize,

    /// Notify granularity of default-sized buffers, in pages
    #[serde(default = "defaults::notify_pages")]
    pub notify_pages: usize,

    /// Default buffers hold this many acquisitions
    #[serde(default = "defaults::repeat_acquisitions")]
    pub repeat_acquisitions: usize,
}

/// Timestamp polling
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TimestampConfig {
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "defaults::max_poll_count")]
    pub max_poll_count: u32,

    #[serde(default = "defaults::timestamp_buffer_bytes")]
    pub buffer_bytes: usize,
}

/// FIFO streaming
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamingConfig {
    #[serde(default = "defaults::fifo_step_samples")]
    pub fifo_step_samples: u64,
}

/// Simulated card behaviour
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MockConfig {
    /// Trigger rate of auto-triggered acquisitions
    #[serde(default = "defaults::frame_rate_hz")]
    pub frame_rate_hz: f64,

    #[serde(default = "defaults::modules")]
    pub modules: u32,

    #[serde(default = "defaults::channels_per_module")]
    pub channels_per_module: u32,

    #[serde(default = "defaults::max_adc_value")]
    pub max_adc_value: i64,

    #[serde(default = "defaults::pretrigger_limit_samples")]
    pub pretrigger_limit_samples: i64,

    #[serde(default = "defaults::memory_step_samples")]
    pub memory_step_samples: i64,

    /// Peak raw value of the noise source
    #[serde(default = "defaults::noise_amplitude")]
    pub noise_amplitude: i16,

    #[serde(default = "defaults::card_type")]
    pub card_type: i64,

    #[serde(default = "defaults::serial_number")]
    pub serial_number: i64,

    #[serde(default = "defaults::mock_timeout_ms")]
    pub timeout_ms: i64,

    #[serde(default = "defaults::pulse_generators")]
    pub pulse_generators: bool,

    #[serde(default = "defaults::pulse_generator_clock_hz")]
    pub pulse_generator_clock_hz: i64,
}

/// Default value providers using constants
mod defaults {
    use crate::config::constants::*;

    pub fn page_size_bytes() -> usize { transfer::PAGE_SIZE_BYTES }
    pub fn notify_pages() -> usize { transfer::DEFAULT_NOTIFY_PAGES }
    pub fn repeat_acquisitions() -> usize { transfer::DEFAULT_REPEAT_ACQUISITIONS }

    pub fn poll_interval_ms() -> u64 { timestamps::DEFAULT_POLL_INTERVAL_MS }
    pub fn max_poll_count() -> u32 { timestamps::DEFAULT_MAX_POLL_COUNT }
    pub fn timestamp_buffer_bytes() -> usize { timestamps::BUFFER_BYTES }

    pub fn fifo_step_samples() -> u64 { streaming::DEFAULT_FIFO_STEP_SAMPLES }

    pub fn frame_rate_hz() -> f64 { mock::DEFAULT_FRAME_RATE_HZ }
    pub fn modules() -> u32 { mock::DEFAULT_MODULES }
    pub fn channels_per_module() -> u32 { mock::DEFAULT_CHANNELS_PER_MODULE }
    pub fn max_adc_value() -> i64 { mock::DEFAULT_MAX_ADC_VALUE }
    pub fn pretrigger_limit_samples() -> i64 { mock::DEFAULT_PRETRIGGER_LIMIT_SAMPLES }
    pub fn memory_step_samples() -> i64 { mock::DEFAULT_MEMORY_STEP_SAMPLES }
    pub fn noise_amplitude() -> i16 { mock::DEFAULT_NOISE_AMPLITUDE }
    pub fn card_type() -> i64 { mock::DEFAULT_CARD_TYPE }
    pub fn serial_number() -> i64 { mock::DEFAULT_SERIAL_NUMBER }
    pub fn mock_timeout_ms() -> i64 { mock::DEFAULT_TIMEOUT_MS }
    pub fn pulse_generators() -> bool { true }
    pub fn pulse_generator_clock_hz() -> i64 { mock::DEFAULT_PULSE_GENERATOR_CLOCK_HZ }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            page_size_bytes: defaults::page_size_bytes(),
            notify_pages: defaults::notify_pages(),
            repeat_acquisitions: defaults::repeat_acquisitions(),
        }
    }
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::poll_interval_ms(),
            max_poll_count: defaults::max_poll_count(),
            buffer_bytes: defaults::timestamp_buffer_bytes(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            fifo_step_samples: defaults::fifo_step_samples(),
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: defaults::frame_rate_hz(),
            modules: defaults::modules(),
            channels_per_module: defaults::channels_per_module(),
            max_adc_value: defaults::max_adc_value(),
            pretrigger_limit_samples: defaults::pretrigger_limit_samples(),
            memory_step_samples: defaults::memory_step_samples(),
            noise_amplitude: defaults::noise_amplitude(),
            card_type: defaults::card_type(),
            serial_number: defaults::serial_number(),
            timeout_ms: defaults::mock_timeout_ms(),
            pulse_generators: defaults::pulse_generators(),
            pulse_generator_clock_hz: defaults::pulse_generator_clock_hz(),
        }
    }
}

impl TransferConfig {
    /// Default notify granularity in bytes
    pub fn default_notify_bytes(&self) -> usize {
        self.page_size_bytes * self.notify_pages
    }
}

impl CoreConfig {
    /// Validate configuration consistency
    pub fn validate_consistency(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.transfer.page_size_bytes == 0 || !self.transfer.page_size_bytes.is_power_of_two() {
            errors.push(format!(
                "Page size must be a power of two, got {}",
                self.transfer.page_size_bytes
            ));
        }
        if self.transfer.notify_pages == 0 {
            errors.push("Notify size must be at least one page".to_string());
        }
        if self.transfer.repeat_acquisitions < transfer::MIN_STREAMING_CHUNKS {
            errors.push(format!(
                "Default buffers must hold at least {} acquisitions",
                transfer::MIN_STREAMING_CHUNKS
            ));
        }
        if self.timestamps.max_poll_count == 0 {
            errors.push("Timestamp polling needs at least one poll".to_string());
        }
        if self.timestamps.buffer_bytes < timestamps::BYTES_PER_TIMESTAMP
            || self.timestamps.buffer_bytes % timestamps::BYTES_PER_TIMESTAMP != 0
        {
            errors.push(format!(
                "Timestamp buffer must be a multiple of {} bytes",
                timestamps::BYTES_PER_TIMESTAMP
            ));
        }
        if self.streaming.fifo_step_samples == 0 {
            errors.push("FIFO step must be non-zero".to_string());
        }
        if !(self.mock.frame_rate_hz > 0.0) {
            errors.push(format!("Mock frame rate must be positive, got {}", self.mock.frame_rate_hz));
        }
        let channels = (self.mock.modules * self.mock.channels_per_module) as usize;
        if channels == 0 || channels > limits::MAX_CHANNELS {
            errors.push(format!(
                "Mock card must have between 1 and {} channels, got {}",
                limits::MAX_CHANNELS,
                channels
            ));
        }
        if self.mock.max_adc_value <= 0 {
            errors.push("Mock ADC full scale must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = CoreConfig::default();
        assert_eq!(config.transfer.default_notify_bytes(), 40960);
        assert_eq!(config.timestamps.max_poll_count, 50);
        assert!(config.validate_consistency().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
[transfer]
notify_pages = 4

[mock]
frame_rate_hz = 500.0
"#,
        )
        .unwrap();
        assert_eq!(config.transfer.notify_pages, 4);
        assert_eq!(config.transfer.repeat_acquisitions, 1000);
        assert_eq!(config.mock.frame_rate_hz, 500.0);
        assert_eq!(config.mock.modules, 2);
    }

    #[test]
    fn test_inconsistent_config_reports_every_problem() {
        let mut config = CoreConfig::default();
        config.transfer.page_size_bytes = 3000;
        config.timestamps.max_poll_count = 0;
        config.mock.frame_rate_hz = 0.0;
        let errors = config.validate_consistency().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CoreConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: CoreConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
