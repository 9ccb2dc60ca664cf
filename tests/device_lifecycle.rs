// tests/device_lifecycle.rs
//! Lifecycle of single digitiser and AWG cards on the simulated driver

use digitiser_core::config::{CoreConfig, MockConfig};
use digitiser_core::device::{library_refcount, Awg, Card, Configurable, DeviceState, Digitiser, Startable};
use digitiser_core::hal::mock::{MockCardKind, MockDriver};
use digitiser_core::hal::registers::{self, command};
use digitiser_core::hal::waveform_source::RampSource;
use digitiser_core::settings::{
    AcquisitionMode, AcquisitionSettings, GenerationSettings, IoLineMode, TriggerDetection, TriggerSettings,
};
use digitiser_core::ErrorKind;
use serial_test::serial;

fn fast() -> MockConfig {
    MockConfig {
        frame_rate_hz: 1000.0,
        ..MockConfig::default()
    }
}

fn ramp_digitiser(driver: &MockDriver) -> Digitiser {
    let address = driver.add_card(MockCardKind::Digitiser, fast(), Box::new(RampSource::new()));
    Digitiser::connect(driver, &address, CoreConfig::default()).expect("Failed to connect digitiser")
}

#[test]
#[serial]
fn test_full_single_shot_lifecycle() {
    let driver = MockDriver::new();
    let refs = library_refcount();
    let mut digitiser = ramp_digitiser(&driver);
    assert_eq!(library_refcount(), refs + 1);
    assert_eq!(digitiser.state(), DeviceState::Idle);

    let settings = AcquisitionSettings::standard_single(20_000_000, 512, &[0, 1]);
    digitiser
        .configure(&settings, &TriggerSettings::software())
        .expect("Failed to configure");
    assert_eq!(digitiser.state(), DeviceState::Configured);
    assert_eq!(digitiser.settings(), Some(&settings));

    let measurement = digitiser
        .execute_standard_single_acquisition()
        .expect("Single-shot acquisition failed");
    assert_eq!(measurement.num_channels(), 2);
    assert_eq!(measurement.samples_per_channel(), 512);
    assert_eq!(digitiser.state(), DeviceState::Stopped);

    // Ramp: channel 1 starts at 1000 counts on a 1 V range
    let expected = 1000.0 / 32767.0;
    assert!((measurement.waveforms[1][0] - expected).abs() < 1e-6);
    assert!(measurement.waveforms[0][1] > measurement.waveforms[0][0]);

    // A stopped card can run again without reconfiguring
    let again = digitiser.execute_standard_single_acquisition().expect("Second run failed");
    assert_eq!(again.samples_per_channel(), 512);

    digitiser.disconnect().expect("Failed to disconnect");
    assert_eq!(digitiser.state(), DeviceState::Disconnected);
    assert_eq!(library_refcount(), refs);
}

#[test]
#[serial]
fn test_configure_writes_setup_last() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    card.clear_write_log();

    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[3]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();

    let log = card.write_log();
    let setup = log
        .iter()
        .position(|&(r, v)| r == registers::CARD_COMMAND && v == command::WRITE_SETUP)
        .expect("write setup issued");
    let mode = log.iter().position(|&(r, _)| r == registers::CARD_MODE).unwrap();
    let enable = log.iter().position(|&(r, _)| r == registers::CHANNEL_ENABLE).unwrap();
    assert!(enable < mode);
    assert!(mode < setup);
    assert_eq!(card.peek(registers::CHANNEL_ENABLE), 0b1000);
}

#[test]
#[serial]
fn test_segmented_acquisition_splits_record() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    let settings = AcquisitionSettings {
        mode: AcquisitionMode::StandardMulti,
        memory_size: Some(1024),
        ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
    };
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    let segments = digitiser.execute_standard_multi_acquisition().unwrap();
    assert_eq!(segments.len(), 4);
    assert!(segments.iter().all(|m| m.samples_per_channel() == 256));
    assert_eq!(digitiser.state(), DeviceState::Stopped);
}

#[test]
#[serial]
fn test_lifecycle_order_is_enforced() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    assert_eq!(digitiser.stop().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(digitiser.core().force_trigger().unwrap_err().kind(), ErrorKind::InvalidState);

    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    digitiser.start().unwrap();
    let err = digitiser.configure(&settings, &TriggerSettings::software()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    digitiser.stop().unwrap();
}

#[test]
#[serial]
fn test_reset_returns_to_idle() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[0, 1]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    digitiser.core_mut().reset().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Idle);
    let card = driver.card(digitiser.core().address()).unwrap();
    assert_eq!(card.peek(registers::CHANNEL_ENABLE), 1);
}

#[test]
#[serial]
fn test_settings_survive_json_storage() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    let stored = serde_json::to_string(&AcquisitionSettings::fifo(40_000_000, 400, &[0, 1, 2, 3])).unwrap();
    let settings: AcquisitionSettings = serde_json::from_str(&stored).unwrap();
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    let buffer = digitiser.transfer_buffer().expect("FIFO configure allocates a buffer");
    assert!(buffer.spec().is_streaming());
    assert_eq!(buffer.notify_bytes(), 10 * 4096);
}

#[test]
#[serial]
fn test_io_lines_and_status() {
    let driver = MockDriver::new();
    let digitiser = ramp_digitiser(&driver);
    let modes = digitiser.core().available_io_line_modes(0).unwrap();
    assert!(modes.contains(&IoLineMode::PulseGenerator));
    digitiser.core().set_io_line_mode(0, IoLineMode::PulseGenerator).unwrap();
    assert_eq!(digitiser.core().io_line_mode(0).unwrap(), IoLineMode::PulseGenerator);
    assert!(digitiser.core().status().unwrap().flags().is_empty());
}

#[test]
#[serial]
fn test_awg_generation_lifecycle() {
    let driver = MockDriver::new();
    let address = driver.add_awg(fast());
    let mut awg = Awg::connect(&driver, &address, CoreConfig::default()).unwrap();
    let waveform: Vec<i16> = (0..128).map(|n| (n * 100) as i16).collect();
    let settings = GenerationSettings::new(waveform, 10_000_000, 3, &[0, 1]);
    awg.configure(&settings, &TriggerSettings::software()).unwrap();

    let card = driver.card(&address).unwrap();
    let onboard = card.onboard_samples();
    assert_eq!(onboard.len(), 256);
    assert_eq!(&onboard[..4], &[0, 0, 100, 100]);

    awg.execute_standard_single_generation().unwrap();
    assert_eq!(awg.state(), DeviceState::Stopped);

    awg.set_amplitude(1, 250).unwrap();
    assert_eq!(card.peek(registers::AMPLITUDE.at(1)), 250);
    assert_eq!(awg.settings().unwrap().amplitudes_mv, vec![1000, 250]);
    awg.set_output_enabled(1, false).unwrap();
    assert!(!awg.output_enabled(1).unwrap());
}

#[test]
#[serial]
fn test_connect_rejects_wrong_card_kind() {
    let driver = MockDriver::new();
    let address = driver.add_awg(fast());
    let err = Digitiser::connect(&driver, &address, CoreConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(Awg::connect(&driver, &address, CoreConfig::default()).is_ok());
}

#[test]
#[serial]
fn test_external_trigger_with_hardware_timestamp() {
    let driver = MockDriver::new();
    let mut digitiser = ramp_digitiser(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    let settings = AcquisitionSettings {
        timestamping: true,
        ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
    };
    let trigger = TriggerSettings::external(0, TriggerDetection::PositiveEdge, 500);
    digitiser.configure(&settings, &trigger).unwrap();
    assert_eq!(card.peek(registers::TRIG_EXT_LEVEL.at(0)), 500);

    let before = chrono::Utc::now();
    let stimulus = {
        let card = std::sync::Arc::clone(&card);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            card.fire_external_trigger();
        })
    };
    let measurement = digitiser.execute_standard_single_acquisition().unwrap();
    stimulus.join().unwrap();

    let stamp = measurement.timestamp.expect("hardware timestamp present");
    assert!(stamp >= before - chrono::Duration::seconds(1));
    assert!(stamp <= chrono::Utc::now());
}
