// src/acquisition/measurement.rs
//! Typed results of an acquisition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frames::deinterleave;

/// Waveforms recorded for one trigger event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// One voltage sequence per enabled channel, in channel order
    pub waveforms: Vec<Vec<f32>>,
    /// Trigger time, when timestamping is enabled
    pub timestamp: Option<DateTime<Utc>>,
}

impl Measurement {
    pub fn new(waveforms: Vec<Vec<f32>>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self { waveforms, timestamp }
    }

    /// Scale one interleaved raw frame into volts
    pub fn from_raw_frame(frame: &[i16], scaling: &[ChannelScaling], timestamp: Option<DateTime<Utc>>) -> Self {
        let waveforms = deinterleave(frame, scaling.len())
            .into_iter()
            .zip(scaling)
            .map(|(raw, scale)| raw.into_iter().map(|sample| scale.to_volts(sample)).collect())
            .collect();
        Self { waveforms, timestamp }
    }

    pub fn num_channels(&self) -> usize {
        self.waveforms.len()
    }

    /// Samples per channel; zero when there are no channels
    pub fn samples_per_channel(&self) -> usize {
        self.waveforms.first().map_or(0, Vec::len)
    }

    /// Concatenate the channels of several cards' measurements in order
    ///
    /// The timestamp is the first one present.
    pub fn merge(parts: impl IntoIterator<Item = Measurement>) -> Self {
        let mut merged = Measurement::new(Vec::new(), None);
        for part in parts {
            merged.waveforms.extend(part.waveforms);
            merged.timestamp = merged.timestamp.or(part.timestamp);
        }
        merged
    }
}

/// Raw-to-volts conversion of one digitiser channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScaling {
    pub range_mv: u32,
    pub offset_percent: i32,
    /// Raw value at full scale
    pub max_adc: i64,
}

impl ChannelScaling {
    /// `range * raw / max_adc` plus the offset fraction of the range, in volts
    pub fn to_volts(&self, raw: i16) -> f32 {
        let range_v = f64::from(self.range_mv) / 1000.0;
        let full_scale = self.max_adc.max(1) as f64;
        let offset_v = f64::from(self.offset_percent) * range_v / 100.0;
        (range_v * f64::from(raw) / full_scale + offset_v) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale(range_mv: u32, offset_percent: i32) -> ChannelScaling {
        ChannelScaling {
            range_mv,
            offset_percent,
            max_adc: 32767,
        }
    }

    #[test]
    fn test_voltage_conversion() {
        assert!((scale(1000, 0).to_volts(32767) - 1.0).abs() < 1e-6);
        assert!((scale(200, 0).to_volts(-32767) + 0.2).abs() < 1e-6);
        assert!((scale(1000, 50).to_volts(0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_frame() {
        let measurement = Measurement::from_raw_frame(&[32767, 0, 0, 32767], &[scale(1000, 0), scale(500, 0)], None);
        assert_eq!(measurement.num_channels(), 2);
        assert_eq!(measurement.samples_per_channel(), 2);
        assert!((measurement.waveforms[1][1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_merge_keeps_channel_order() {
        let now = Utc::now();
        let a = Measurement::new(vec![vec![1.0], vec![2.0]], None);
        let b = Measurement::new(vec![vec![3.0]], Some(now));
        let merged = Measurement::merge([a, b]);
        assert_eq!(merged.waveforms, vec![vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(merged.timestamp, Some(now));
    }
}
