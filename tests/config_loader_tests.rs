// tests/config_loader_tests.rs
//! Layered TOML configuration feeding card connections

use std::io::Write;

use digitiser_core::config::{ConfigError, ConfigLoader, CoreConfig};
use digitiser_core::device::{Configurable, Digitiser};
use digitiser_core::hal::mock::MockDriver;
use digitiser_core::settings::{AcquisitionSettings, TriggerSettings};
use serial_test::serial;
use tempfile::{NamedTempFile, TempDir};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
#[serial]
fn test_loaded_config_sizes_transfer_buffers() {
    let file = write_config(
        "[transfer]\nnotify_pages = 4\nrepeat_acquisitions = 16\n\n[mock]\nframe_rate_hz = 1000.0\n",
    );
    let mut loader =
        ConfigLoader::with_paths(vec![file.path().to_path_buf()]).with_env_prefix("DIGITISER_IT_SIZES_");
    let config = loader.load().expect("load config");
    assert_eq!(config.transfer.default_notify_bytes(), 4 * 4096);
    assert_eq!(loader.current(), &config);

    let driver = MockDriver::new();
    let address = driver.add_digitiser(config.mock.clone());
    let mut digitiser = Digitiser::connect(&driver, &address, config).unwrap();
    let settings = AcquisitionSettings::fifo(10_000_000, 1024, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();

    let buffer = digitiser.transfer_buffer().unwrap();
    assert_eq!(buffer.notify_bytes(), 16_384);
    // 16 frames of 2 KiB, rounded up to whole notify chunks
    assert_eq!(buffer.capacity_bytes(), 2 * 16_384);
}

#[test]
#[serial]
fn test_environment_beats_files() {
    let file = write_config("[streaming]\nfifo_step_samples = 16\n\n[timestamps]\nmax_poll_count = 5\n");
    std::env::set_var("DIGITISER_IT_ENV_TIMESTAMPS_MAX_POLL_COUNT", "9");
    let mut loader =
        ConfigLoader::with_paths(vec![file.path().to_path_buf()]).with_env_prefix("DIGITISER_IT_ENV_");
    let loaded = loader.load();
    std::env::remove_var("DIGITISER_IT_ENV_TIMESTAMPS_MAX_POLL_COUNT");

    let config = loaded.expect("load config");
    assert_eq!(config.streaming.fifo_step_samples, 16);
    assert_eq!(config.timestamps.max_poll_count, 9);
}

#[test]
fn test_export_then_reload() {
    let dir = TempDir::new().unwrap();
    let first = write_config("[mock]\nmodules = 1\nchannels_per_module = 4\n");
    let mut loader = ConfigLoader::with_paths(vec![first.path().to_path_buf()]).with_env_prefix("DIGITISER_IT_EXPORT_");
    let original = loader.load().unwrap();

    let exported = dir.path().join("digitiser.toml");
    loader.export_config(&exported).unwrap();
    let reloaded = loader.validate_config_file(&exported).unwrap();
    assert_eq!(reloaded, original);
    assert_eq!(reloaded.mock.modules, 1);
}

#[test]
fn test_bad_files_are_reported() {
    let loader = ConfigLoader::with_paths(Vec::new());

    let malformed = write_config("[transfer\nnotify_pages = ");
    assert!(matches!(
        loader.validate_config_file(malformed.path()),
        Err(ConfigError::ParseError(_))
    ));

    let inconsistent = write_config("[mock]\nmodules = 0\n\n[streaming]\nfifo_step_samples = 0\n");
    match loader.validate_config_file(inconsistent.path()) {
        Err(ConfigError::ValidationError(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("Expected validation errors, got {other:?}"),
    }

    let mut layered = ConfigLoader::with_paths(vec![malformed.path().to_path_buf()])
        .with_env_prefix("DIGITISER_IT_BAD_");
    assert!(layered.load().is_err());
    assert_eq!(layered.current(), &CoreConfig::default());
}
