// tests/error_propagation_tests.rs
//! Fault translation, rejected settings and recovery after failed operations

use digitiser_core::config::{CoreConfig, MockConfig};
use digitiser_core::device::{
    is_claimed, library_refcount, Awg, Card, Configurable, DeviceState, Digitiser, Startable, Streamable,
};
use digitiser_core::hal::mock::{FaultTrigger, MockDriver};
use digitiser_core::hal::registers::{self, command};
use digitiser_core::hal::{BufferKind, FaultCode};
use digitiser_core::settings::{AcquisitionSettings, GenerationSettings, TriggerDetection, TriggerSettings};
use digitiser_core::{CardError, ConfigRule, ErrorKind};
use serial_test::serial;

fn fast() -> MockConfig {
    MockConfig {
        frame_rate_hz: 1000.0,
        ..MockConfig::default()
    }
}

fn connect(driver: &MockDriver) -> Digitiser {
    let address = driver.add_digitiser(fast());
    Digitiser::connect(driver, &address, CoreConfig::default()).expect("Failed to connect digitiser")
}

#[test]
#[serial]
fn test_timeout_leaves_card_running_for_retry() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    let settings = AcquisitionSettings {
        timeout_ms: 20,
        ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
    };
    let trigger = TriggerSettings::external(1, TriggerDetection::PositiveEdge, 0);
    digitiser.configure(&settings, &trigger).unwrap();

    let err = digitiser.execute_standard_single_acquisition().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(digitiser.state(), DeviceState::Running);
    assert!(card.is_running());

    card.fire_external_trigger();
    digitiser.wait_for_acquisition_to_complete().expect("retry after trigger");
    let measurement = digitiser.retrieve_standard_single_measurement().unwrap();
    assert_eq!(measurement.samples_per_channel(), 256);
    digitiser.stop().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Stopped);
}

#[test]
#[serial]
fn test_second_handle_is_refused() {
    let driver = MockDriver::new();
    let address = driver.add_digitiser(fast());
    let mut first = Digitiser::connect(&driver, &address, CoreConfig::default()).unwrap();
    assert!(is_claimed(&address));

    let err = Digitiser::connect(&driver, &address, CoreConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceInUse);
    assert_eq!(driver.card(&address).unwrap().open_handles(), 1);

    first.disconnect().unwrap();
    assert!(!is_claimed(&address));
    let mut second = Digitiser::connect(&driver, &address, CoreConfig::default()).unwrap();
    second.disconnect().unwrap();
}

#[test]
#[serial]
fn test_card_claimed_by_other_process() {
    let driver = MockDriver::new();
    let address = driver.add_digitiser(fast());
    driver.card(&address).unwrap().set_claimed_elsewhere(true);
    let refs = library_refcount();

    let err = Digitiser::connect(&driver, &address, CoreConfig::default()).unwrap_err();
    assert!(matches!(err, CardError::DeviceInUse { .. }));
    assert_eq!(library_refcount(), refs);
    assert!(!is_claimed(&address));
}

#[test]
#[serial]
fn test_write_fault_carries_code_and_register() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    card.inject_fault(FaultTrigger::Write(registers::SAMPLE_RATE), FaultCode::BOARD_LOCKED);

    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[0]);
    let err = digitiser.configure(&settings, &TriggerSettings::software()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);
    assert_eq!(err.fault_code(), Some(FaultCode::BOARD_LOCKED));
    assert!(err.to_string().contains("SAMPLE_RATE"));
    assert_eq!(digitiser.state(), DeviceState::Idle);

    // The injected fault fires once
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    assert_eq!(digitiser.state(), DeviceState::Configured);
}

#[test]
#[serial]
fn test_failed_reconfigure_drops_back_to_idle() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    digitiser
        .configure(&AcquisitionSettings::fifo(10_000_000, 2048, &[0]), &TriggerSettings::software())
        .unwrap();
    assert!(digitiser.transfer_buffer().is_some());

    card.inject_fault(FaultTrigger::Write(registers::SAMPLE_RATE), FaultCode::BOARD_LOCKED);
    let wider = AcquisitionSettings::fifo(10_000_000, 2048, &[0, 1]);
    let err = digitiser.configure(&wider, &TriggerSettings::software()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);

    // Card registers hold part of the new settings, so nothing may run on them
    assert_eq!(digitiser.state(), DeviceState::Idle);
    assert!(digitiser.settings().is_none());
    assert!(digitiser.transfer_buffer().is_none());
    assert_eq!(digitiser.start().unwrap_err().kind(), ErrorKind::InvalidState);
    assert!(!card.is_running());

    digitiser.configure(&wider, &TriggerSettings::software()).unwrap();
    let measurements = digitiser.execute_finite_fifo_acquisition(1).unwrap();
    assert_eq!(measurements[0].num_channels(), 2);
}

#[test]
#[serial]
fn test_failed_awg_reconfigure_drops_back_to_idle() {
    let driver = MockDriver::new();
    let address = driver.add_awg(fast());
    let card = driver.card(&address).unwrap();
    let mut awg = Awg::connect(&driver, &address, CoreConfig::default()).unwrap();
    let settings = GenerationSettings::new(vec![100; 64], 10_000_000, 1, &[0]);
    awg.configure(&settings, &TriggerSettings::software()).unwrap();

    card.inject_fault(FaultTrigger::Write(registers::SAMPLE_RATE), FaultCode::BOARD_LOCKED);
    assert!(awg.configure(&settings, &TriggerSettings::software()).is_err());
    assert_eq!(awg.state(), DeviceState::Idle);
    assert!(awg.settings().is_none());
    assert_eq!(awg.start().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
#[serial]
fn test_timestamp_stream_released() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    let stamped = AcquisitionSettings {
        timestamping: true,
        ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
    };
    digitiser.configure(&stamped, &TriggerSettings::software()).unwrap();
    assert!(card.has_transfer(BufferKind::Timestamp));

    card.clear_write_log();
    let plain = AcquisitionSettings::standard_single(10_000_000, 256, &[0]);
    digitiser.configure(&plain, &TriggerSettings::software()).unwrap();
    assert!(!card.has_transfer(BufferKind::Timestamp));
    assert!(card.commands().iter().any(|c| c & command::EXTRA_STOP_DMA != 0));

    digitiser.configure(&stamped, &TriggerSettings::software()).unwrap();
    assert!(card.has_transfer(BufferKind::Timestamp));
    card.clear_write_log();
    digitiser.disconnect().unwrap();
    assert!(!card.has_transfer(BufferKind::Timestamp));
    assert!(card.commands().iter().any(|c| c & command::EXTRA_STOP_DMA != 0));
}

#[test]
#[serial]
fn test_rejected_settings_touch_nothing() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    card.clear_write_log();

    let cases = [
        (
            AcquisitionSettings {
                post_trigger_length: Some(512),
                ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
            },
            ConfigRule::PostTriggerExceedsSegment,
        ),
        (
            AcquisitionSettings {
                vertical_ranges_mv: vec![1000, 1000],
                ..AcquisitionSettings::standard_single(10_000_000, 256, &[0])
            },
            ConfigRule::ChannelArrayLength,
        ),
        (
            AcquisitionSettings::standard_single(10_000_000, 256, &[0, 9]),
            ConfigRule::ChannelNotPresent,
        ),
    ];
    for (settings, rule) in cases {
        let err = digitiser.configure(&settings, &TriggerSettings::software()).unwrap_err();
        assert_eq!(err.rule(), Some(rule), "{err}");
    }
    assert!(card.write_log().is_empty());
    assert_eq!(digitiser.state(), DeviceState::Idle);
}

#[test]
#[serial]
fn test_start_fault_keeps_configured_state() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    let card = driver.card(digitiser.core().address()).unwrap();
    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    card.inject_fault(FaultTrigger::Command(command::CARD_START), FaultCode::SETUP);

    let err = digitiser.start().unwrap_err();
    assert_eq!(err.fault_code(), Some(FaultCode::SETUP));
    assert_eq!(digitiser.state(), DeviceState::Configured);
    assert!(digitiser.execute_standard_single_acquisition().is_ok());
}

#[test]
#[serial]
fn test_library_refcount_follows_connections() {
    let driver = MockDriver::new();
    let base = library_refcount();
    let mut a = connect(&driver);
    let b = connect(&driver);
    assert_eq!(library_refcount(), base + 2);
    a.disconnect().unwrap();
    assert_eq!(library_refcount(), base + 1);
    drop(b);
    assert_eq!(library_refcount(), base);
}

#[test]
#[serial]
fn test_operations_after_disconnect() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver);
    digitiser.disconnect().unwrap();
    let settings = AcquisitionSettings::standard_single(10_000_000, 256, &[0]);
    let err = digitiser.configure(&settings, &TriggerSettings::software()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    // Disconnecting twice is harmless
    digitiser.disconnect().unwrap();
}
