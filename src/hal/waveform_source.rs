// src/hal/waveform_source.rs
//! Sample generators for simulated cards

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::traits::WaveformSource;

/// Uniform noise in `[-amplitude, amplitude]`
pub struct UniformNoiseSource {
    amplitude: i16,
    rng: StdRng,
}

impl UniformNoiseSource {
    /// Noise source seeded from entropy
    pub fn new(amplitude: i16) -> Self {
        Self {
            amplitude: amplitude.saturating_abs(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible noise source
    pub fn seeded(amplitude: i16, seed: u64) -> Self {
        Self {
            amplitude: amplitude.saturating_abs(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl WaveformSource for UniformNoiseSource {
    fn next_block(&mut self, num_samples: usize, num_channels: usize) -> Vec<i16> {
        let amplitude = self.amplitude;
        (0..num_samples * num_channels)
            .map(|_| self.rng.gen_range(-amplitude..=amplitude))
            .collect()
    }
}

/// Per-channel ramp: channel `c` emits `c * 1000 + n` for sample `n`
///
/// Makes channel ordering and sample continuity visible in tests.
#[derive(Debug, Default)]
pub struct RampSource {
    position: u64,
}

impl RampSource {
    /// Ramp starting at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaveformSource for RampSource {
    fn next_block(&mut self, num_samples: usize, num_channels: usize) -> Vec<i16> {
        let mut block = Vec::with_capacity(num_samples * num_channels);
        for n in 0..num_samples as u64 {
            let sample = ((self.position + n) % 1000) as i16;
            for channel in 0..num_channels {
                block.push(channel as i16 * 1000 + sample);
            }
        }
        self.position += num_samples as u64;
        block
    }
}
