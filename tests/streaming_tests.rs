// tests/streaming_tests.rs
//! FIFO acquisition and generation through notify-chunked transfer buffers

use std::thread;
use std::time::Duration;

use digitiser_core::acquisition::BufferSpec;
use digitiser_core::config::{CoreConfig, MockConfig};
use digitiser_core::device::{Awg, CancellationToken, Configurable, DeviceState, Digitiser, Startable, Streamable};
use digitiser_core::hal::mock::{MockCardKind, MockDriver};
use digitiser_core::hal::waveform_source::RampSource;
use digitiser_core::hal::{BufferDirection, BufferKind};
use digitiser_core::settings::{AcquisitionSettings, GenerationMode, GenerationSettings, TriggerSettings};
use digitiser_core::ErrorKind;
use serial_test::serial;

fn fast() -> MockConfig {
    MockConfig {
        frame_rate_hz: 1000.0,
        ..MockConfig::default()
    }
}

fn connect_digitiser(driver: &MockDriver) -> Digitiser {
    let address = driver.add_card(MockCardKind::Digitiser, fast(), Box::new(RampSource::new()));
    Digitiser::connect(driver, &address, CoreConfig::default()).expect("Failed to connect digitiser")
}

#[test]
#[serial]
fn test_finite_fifo_acquisition() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    let settings = AcquisitionSettings::fifo(40_000_000, 400, &[0, 1, 2, 3]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();

    let measurements = digitiser
        .execute_finite_fifo_acquisition(2)
        .expect("Finite FIFO acquisition failed");
    assert_eq!(measurements.len(), 2);
    for measurement in &measurements {
        assert_eq!(measurement.num_channels(), 4);
        assert_eq!(measurement.samples_per_channel(), 400);
    }
    assert_eq!(digitiser.state(), DeviceState::Stopped);

    // Consecutive frames continue the ramp
    let last_of_first = measurements[0].waveforms[0][399];
    let first_of_second = measurements[1].waveforms[0][0];
    assert!(first_of_second > last_of_first);
}

#[test]
#[serial]
fn test_batches_follow_batch_size() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    let settings = AcquisitionSettings {
        batch_size: 2,
        ..AcquisitionSettings::fifo(10_000_000, 512, &[0, 1])
    };
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    assert_eq!(digitiser.batch_size(), 2);
    let measurements = digitiser.execute_finite_fifo_acquisition(4).unwrap();
    assert_eq!(measurements.len(), 4);
}

#[test]
#[serial]
fn test_continuous_acquisition_and_cancel() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    // One frame fills exactly one notify chunk
    let settings = AcquisitionSettings::fifo(10_000_000, 20_480, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    digitiser.execute_continuous_fifo_acquisition().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Running);

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        let batch = digitiser.next_measurements(&cancel).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].samples_per_channel(), 20_480);
    }

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = digitiser.next_measurements(&cancelled).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    digitiser.stop().unwrap();
    assert_eq!(digitiser.state(), DeviceState::Stopped);
}

#[test]
#[serial]
fn test_slow_consumer_reports_overrun() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    let spec = BufferSpec::new(BufferKind::Data, BufferDirection::CardToHost, 16_384, 4096);
    digitiser.define_transfer_buffer(spec).unwrap();
    let settings = AcquisitionSettings::fifo(10_000_000, 2048, &[0]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    assert_eq!(digitiser.transfer_buffer().map(|b| b.capacity_bytes()), Some(16_384));

    digitiser.execute_continuous_fifo_acquisition().unwrap();
    thread::sleep(Duration::from_millis(100));
    let err = digitiser.next_measurements(&CancellationToken::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamOverrun);

    digitiser.stop().expect("stop after overrun");
    assert_eq!(digitiser.state(), DeviceState::Stopped);
}

#[test]
#[serial]
fn test_fifo_restart_after_stop() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    let settings = AcquisitionSettings::fifo(10_000_000, 2048, &[0, 1]);
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    assert_eq!(digitiser.execute_finite_fifo_acquisition(1).unwrap().len(), 1);
    assert_eq!(digitiser.execute_finite_fifo_acquisition(2).unwrap().len(), 2);
}

#[test]
#[serial]
fn test_software_trigger_timestamps() {
    let driver = MockDriver::new();
    let mut digitiser = connect_digitiser(&driver);
    let settings = AcquisitionSettings {
        timestamping: true,
        ..AcquisitionSettings::fifo(10_000_000, 2048, &[0])
    };
    digitiser.configure(&settings, &TriggerSettings::software()).unwrap();
    let measurements = digitiser.execute_finite_fifo_acquisition(3).unwrap();
    assert!(measurements.iter().all(|m| m.timestamp.is_some()));
    assert!(measurements[0].timestamp <= measurements[2].timestamp);
}

#[test]
#[serial]
fn test_fifo_generation_streams_blocks() {
    let driver = MockDriver::new();
    let address = driver.add_awg(fast());
    let mut awg = Awg::connect(&driver, &address, CoreConfig::default()).unwrap();
    let settings = GenerationSettings {
        mode: GenerationMode::FifoSingle,
        ..GenerationSettings::new(vec![0; 64], 10_000_000, 0, &[0])
    };
    awg.configure(&settings, &TriggerSettings::software()).unwrap();
    assert!(awg.transfer_buffer().is_none());

    let blocks = (0..12).map(|n| vec![n as i16; 10_240]);
    let sent = awg
        .execute_fifo_generation(blocks, &CancellationToken::new())
        .expect("FIFO generation failed");
    assert_eq!(sent, 12 * 10_240);
    assert_eq!(awg.state(), DeviceState::Running);
    let metrics = awg.transfer_buffer().unwrap().metrics();
    assert_eq!(metrics.bytes, 12 * 10_240 * 2);

    awg.stop().unwrap();
    assert_eq!(awg.state(), DeviceState::Stopped);
}

#[test]
#[serial]
fn test_fifo_generation_honours_cancel() {
    let driver = MockDriver::new();
    let address = driver.add_awg(fast());
    let mut awg = Awg::connect(&driver, &address, CoreConfig::default()).unwrap();
    let settings = GenerationSettings {
        mode: GenerationMode::FifoSingle,
        ..GenerationSettings::new(vec![0; 64], 10_000_000, 0, &[0])
    };
    awg.configure(&settings, &TriggerSettings::software()).unwrap();

    // More blocks than the buffer holds, so the cancel is seen after start
    let cancel = CancellationToken::new();
    cancel.cancel();
    let blocks = (0..40).map(|_| vec![1i16; 20_480]);
    let err = awg.execute_fifo_generation(blocks, &cancel).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(awg.state(), DeviceState::Running);
    awg.stop().unwrap();
}
