// src/acquisition/frames.rs
//! Reassembly of notify chunks into whole interleaved frames

use ndarray::ArrayView2;
use std::collections::VecDeque;

/// Collects streamed samples and yields complete frames
///
/// Notify chunks are sized by the page-aligned buffer, frames by the
/// acquisition; the two rarely line up, so samples are queued until a whole
/// frame is present.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    pending: VecDeque<i16>,
    frame_samples: usize,
}

impl FrameAssembler {
    /// Assembler for frames of `frame_samples` interleaved samples
    pub fn new(frame_samples: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frame_samples: frame_samples.max(1),
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Queue one chunk
    pub fn push(&mut self, chunk: &[i16]) {
        self.pending.extend(chunk.iter().copied());
    }

    /// Whole frames currently queued
    pub fn ready_frames(&self) -> usize {
        self.pending.len() / self.frame_samples
    }

    /// Samples queued, including a partial frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Next complete frame, if one is queued
    pub fn pop_frame(&mut self) -> Option<Vec<i16>> {
        if self.pending.len() < self.frame_samples {
            return None;
        }
        Some(self.pending.drain(..self.frame_samples).collect())
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Split an interleaved frame into one sample sequence per channel
///
/// Samples are stored channel-fastest: `[c0 s0, c1 s0, c0 s1, c1 s1, ...]`.
/// A trailing partial row is ignored.
pub fn deinterleave(frame: &[i16], channels: usize) -> Vec<Vec<i16>> {
    if channels == 0 {
        return Vec::new();
    }
    let rows = frame.len() / channels;
    match ArrayView2::from_shape((rows, channels), &frame[..rows * channels]) {
        Ok(view) => view.columns().into_iter().map(|column| column.to_vec()).collect(),
        Err(_) => vec![Vec::new(); channels],
    }
}

/// Split a standard-mode record of several segments into frames
pub fn split_segments(record: &[i16], frame_samples: usize) -> Vec<Vec<i16>> {
    record
        .chunks_exact(frame_samples.max(1))
        .map(|segment| segment.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_span_chunks() {
        let mut assembler = FrameAssembler::new(6);
        assembler.push(&[1, 2, 3, 4]);
        assert!(assembler.pop_frame().is_none());
        assembler.push(&[5, 6, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(assembler.ready_frames(), 2);
        assert_eq!(assembler.pop_frame(), Some(vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(assembler.pop_frame(), Some(vec![7, 8, 9, 10, 11, 12]));
        assert_eq!(assembler.buffered(), 1);
    }

    #[test]
    fn test_deinterleave_channels() {
        let waveforms = deinterleave(&[0, 10, 20, 1, 11, 21], 3);
        assert_eq!(waveforms, vec![vec![0, 1], vec![10, 11], vec![20, 21]]);
        assert!(deinterleave(&[1, 2], 0).is_empty());
    }

    #[test]
    fn test_split_segments() {
        let segments = split_segments(&[1, 2, 3, 4, 5, 6], 2);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2], vec![5, 6]);
    }
}
