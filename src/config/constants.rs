// src/config/constants.rs
//! Fixed values and default settings

/// Host transfer sizing
pub mod transfer {
    pub const PAGE_SIZE_BYTES: usize = 4096;
    pub const DEFAULT_NOTIFY_PAGES: usize = 10;
    pub const DEFAULT_REPEAT_ACQUISITIONS: usize = 1000;
    /// Notify sizes accepted below one page
    pub const SUB_PAGE_NOTIFY_BYTES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];
    pub const MIN_STREAMING_CHUNKS: usize = 2;
}

/// Timestamp polling
pub mod timestamps {
    pub const BUFFER_BYTES: usize = 4096;
    pub const BYTES_PER_TIMESTAMP: usize = 16;
    pub const DEFAULT_MAX_POLL_COUNT: u32 = 50;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
}

/// FIFO streaming
pub mod streaming {
    /// FIFO segment and post-trigger lengths are multiples of this
    pub const DEFAULT_FIFO_STEP_SAMPLES: u64 = 8;
    pub const DEFAULT_TIMEOUT_MS: u32 = 1000;
}

/// Channel and trigger limits
pub mod limits {
    pub const ALLOWED_ENABLED_CHANNEL_COUNTS: [usize; 4] = [1, 2, 4, 8];
    pub const EXTERNAL_TRIGGER_LINES: usize = 4;
    pub const IO_LINES: usize = 4;
    pub const PULSE_GENERATORS: usize = 4;
    pub const MAX_CHANNELS: usize = 16;
}

/// Simulated card defaults
pub mod mock {
    pub const DEFAULT_FRAME_RATE_HZ: f64 = 10.0;
    pub const DEFAULT_MODULES: u32 = 2;
    pub const DEFAULT_CHANNELS_PER_MODULE: u32 = 4;
    pub const DEFAULT_MAX_ADC_VALUE: i64 = 32767;
    pub const DEFAULT_PRETRIGGER_LIMIT_SAMPLES: i64 = 8192;
    pub const DEFAULT_MEMORY_STEP_SAMPLES: i64 = 32;
    pub const DEFAULT_NOISE_AMPLITUDE: i16 = 2000;
    pub const DEFAULT_CARD_TYPE: i64 = 0x0007_4421;
    pub const DEFAULT_SERIAL_NUMBER: i64 = 12345;
    pub const DEFAULT_TIMEOUT_MS: i64 = 1000;
    pub const DEFAULT_PULSE_GENERATOR_CLOCK_HZ: i64 = 100_000_000;
}

/// Config file locations
pub mod paths {
    pub const SYSTEM_CONFIG_PATH: &str = "/etc/digitiser-core/config.toml";
    pub const DEFAULT_CONFIG_FILE: &str = "digitiser.toml";
    pub const LOCAL_CONFIG_FILE: &str = "digitiser.local.toml";
    pub const ENV_PREFIX: &str = "DIGITISER_";
}
