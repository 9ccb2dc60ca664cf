// tests/pulse_generator_tests.rs
//! Pulse generator setup, coercion and triggering on simulated cards

use digitiser_core::config::{CoreConfig, MockConfig};
use digitiser_core::device::{Card, Configurable, DeviceState, Digitiser, Startable};
use digitiser_core::hal::mock::MockDriver;
use digitiser_core::hal::registers::{self, pulsegen};
use digitiser_core::settings::{
    AcquisitionSettings, IoLineMode, PulseGeneratorMode, PulseGeneratorMultiplexer1, PulseGeneratorMultiplexer2,
    PulseGeneratorOutputSettings, PulseGeneratorTriggerDetection, PulseGeneratorTriggerSettings, TriggerSettings,
};
use digitiser_core::{ConfigRule, ErrorKind};
use serial_test::serial;

fn connect(driver: &MockDriver, config: MockConfig) -> Digitiser {
    let address = driver.add_digitiser(config);
    Digitiser::connect(driver, &address, CoreConfig::default()).expect("Failed to connect digitiser")
}

fn fast() -> MockConfig {
    MockConfig {
        frame_rate_hz: 1000.0,
        ..MockConfig::default()
    }
}

#[test]
#[serial]
fn test_output_converted_to_clock_cycles() {
    let driver = MockDriver::new();
    let digitiser = connect(&driver, fast());
    let card = driver.card(digitiser.core().address()).unwrap();
    let generator = digitiser.core().pulse_generator(1).unwrap();
    assert_eq!(generator.index(), 1);
    assert_eq!(generator.clock_hz(), 100e6);

    let output = PulseGeneratorOutputSettings {
        period_s: 1e-6,
        duty_cycle: 0.25,
        num_pulses: 10,
        delay_s: 2e-7,
        inverted: true,
    };
    generator.configure_output(&output).unwrap();
    assert_eq!(card.peek(registers::PULSEGEN_LEN.at(1)), 100);
    assert_eq!(card.peek(registers::PULSEGEN_HIGH.at(1)), 25);
    assert_eq!(card.peek(registers::PULSEGEN_LOOPS.at(1)), 10);
    assert_eq!(card.peek(registers::PULSEGEN_DELAY.at(1)), 20);
    assert!(generator.output_inverted().unwrap());

    assert!((generator.period_s().unwrap() - 1e-6).abs() < 1e-12);
    assert!((generator.duty_cycle().unwrap() - 0.25).abs() < 1e-9);
    assert_eq!(generator.num_pulses().unwrap(), 10);
    assert!((generator.delay_s().unwrap() - 2e-7).abs() < 1e-12);
}

#[test]
#[serial]
fn test_unreachable_values_are_coerced() {
    let driver = MockDriver::new();
    let digitiser = connect(&driver, fast());
    let generator = digitiser.core().pulse_generator(0).unwrap();

    // 16.6 cycles is off the 2-cycle grid
    let odd = PulseGeneratorOutputSettings {
        period_s: 1.66e-7,
        ..PulseGeneratorOutputSettings::default()
    };
    generator.configure_output(&odd).unwrap();
    assert!((generator.period_s().unwrap() - 1.6e-7).abs() < 1e-12);

    // Beyond the longest period and pulse count
    let long = PulseGeneratorOutputSettings {
        period_s: 1.0,
        num_pulses: 5000,
        ..PulseGeneratorOutputSettings::default()
    };
    generator.configure_output(&long).unwrap();
    assert!((generator.period_s().unwrap() - 0.01).abs() < 1e-9);
    assert_eq!(generator.num_pulses().unwrap(), 1000);

    let bad = PulseGeneratorOutputSettings {
        duty_cycle: 1.5,
        ..PulseGeneratorOutputSettings::default()
    };
    assert_eq!(
        generator.configure_output(&bad).unwrap_err().rule(),
        Some(ConfigRule::ValueOutOfRange)
    );
}

#[test]
#[serial]
fn test_trigger_setup_reads_back() {
    let driver = MockDriver::new();
    let digitiser = connect(&driver, fast());
    let generator = digitiser.core().pulse_generator(2).unwrap();
    assert_eq!(generator.mode().unwrap(), PulseGeneratorMode::Gated);

    let trigger = PulseGeneratorTriggerSettings {
        mode: PulseGeneratorMode::Triggered,
        detection: PulseGeneratorTriggerDetection::High,
        multiplexer_1: PulseGeneratorMultiplexer1::RunState,
        multiplexer_1_inverted: false,
        multiplexer_2: PulseGeneratorMultiplexer2::IoLine(1),
        multiplexer_2_inverted: true,
    };
    generator.configure_trigger(&trigger).unwrap();
    assert_eq!(generator.trigger_settings().unwrap(), trigger);

    let out_of_range = PulseGeneratorTriggerSettings {
        multiplexer_2: PulseGeneratorMultiplexer2::PulseGenerator(4),
        ..trigger
    };
    assert!(generator.configure_trigger(&out_of_range).is_err());
}

#[test]
#[serial]
fn test_force_trigger_needs_software_source() {
    let driver = MockDriver::new();
    let digitiser = connect(&driver, fast());
    let card = driver.card(digitiser.core().address()).unwrap();
    let generator = digitiser.core().pulse_generator(0).unwrap();

    let err = generator.force_trigger().unwrap_err();
    assert_eq!(err.rule(), Some(ConfigRule::SoftwareTriggerRequired));

    generator
        .configure_trigger(&PulseGeneratorTriggerSettings::software(PulseGeneratorMode::SingleShot))
        .unwrap();
    generator.force_trigger().unwrap();
    assert!(card
        .write_log()
        .contains(&(registers::PULSEGEN_COMMAND, pulsegen::COMMAND_FORCE)));
}

#[test]
#[serial]
fn test_enable_mask_is_per_generator() {
    let driver = MockDriver::new();
    let digitiser = connect(&driver, fast());
    let card = driver.card(digitiser.core().address()).unwrap();
    let first = digitiser.core().pulse_generator(0).unwrap();
    let third = digitiser.core().pulse_generator(2).unwrap();

    first.enable().unwrap();
    third.enable().unwrap();
    assert_eq!(card.peek(registers::PULSEGEN_ENABLE), 0b101);
    first.disable().unwrap();
    assert_eq!(card.peek(registers::PULSEGEN_ENABLE), 0b100);
    assert!(!first.is_enabled().unwrap());
    assert!(third.is_enabled().unwrap());
}

#[test]
#[serial]
fn test_missing_feature_and_bad_index() {
    let driver = MockDriver::new();
    let plain = connect(
        &driver,
        MockConfig {
            pulse_generators: false,
            ..fast()
        },
    );
    let err = plain.core().pulse_generator(0).unwrap_err();
    assert_eq!(err.rule(), Some(ConfigRule::FeatureNotSupported));

    let digitiser = connect(&driver, fast());
    let err = digitiser.core().pulse_generator(4).unwrap_err();
    assert_eq!(err.rule(), Some(ConfigRule::ValueOutOfRange));
}

#[test]
#[serial]
fn test_generator_usable_while_acquiring() {
    let driver = MockDriver::new();
    let mut digitiser = connect(&driver, fast());
    digitiser.core().set_io_line_mode(0, IoLineMode::PulseGenerator).unwrap();
    let settings = AcquisitionSettings::fifo(10_000_000, 2048, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    digitiser.start().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Running);

    let generator = digitiser.core().pulse_generator(0).unwrap();
    generator.configure_output(&PulseGeneratorOutputSettings::default()).unwrap();
    generator
        .configure_trigger(&PulseGeneratorTriggerSettings::software(PulseGeneratorMode::Triggered))
        .unwrap();
    generator.enable().unwrap();
    generator.force_trigger().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Running);

    digitiser.stop().unwrap();
    // A generator does not outlive the connection
    digitiser.disconnect().unwrap();
    assert_eq!(generator.is_enabled().unwrap_err().kind(), ErrorKind::DeviceFault);
}
