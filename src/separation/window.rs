//! Overlapping window planning and cross-fade stitching.
//!
//! A clip of `total` frames is covered by windows of `window_frames` that start
//! every `stride = window_frames - overlap_frames`. The final window is cut at
//! the end of the clip, so it may be shorter, but it always extends past the
//! overlap it shares with its predecessor.
//!
//! Stitching weights each window with linear ramps over the shared regions
//! (none at the clip edges) and divides by the accumulated weight, so the
//! result always has exactly `total` frames.

use super::backend::BackendError;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub window_frames: usize,
    pub overlap_frames: usize,
}

impl WindowPlan {
    pub fn new(window_frames: usize, overlap_frames: usize) -> Result<Self, BackendError> {
        if window_frames == 0 {
            return Err(BackendError::Input("Chunk must span at least one frame".to_string()));
        }
        if overlap_frames >= window_frames {
            return Err(BackendError::Input(format!(
                "Overlap of {} frames does not fit in a {}-frame chunk",
                overlap_frames, window_frames
            )));
        }
        Ok(Self {
            window_frames,
            overlap_frames,
        })
    }

    /// Convert second-based chunk parameters to frames at `sample_rate`.
    pub fn from_seconds(chunk_seconds: f64, overlap_seconds: f64, sample_rate: u32) -> Result<Self, BackendError> {
        if !(chunk_seconds > 0.0) || !(overlap_seconds >= 0.0) {
            return Err(BackendError::Input(format!(
                "Invalid chunking: chunk={}s overlap={}s",
                chunk_seconds, overlap_seconds
            )));
        }
        let window = (chunk_seconds * sample_rate as f64).round() as usize;
        let overlap = (overlap_seconds * sample_rate as f64).round() as usize;
        Self::new(window, overlap)
    }

    pub fn stride(&self) -> usize {
        self.window_frames - self.overlap_frames
    }

    /// Frame ranges covering `0..total`, in order.
    pub fn windows(&self, total: usize) -> Vec<Range<usize>> {
        if total <= self.window_frames {
            return vec![0..total];
        }

        let mut ranges = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.window_frames).min(total);
            ranges.push(start..end);
            if end == total {
                break;
            }
            start += self.stride();
        }
        ranges
    }

    /// Blend per-window outputs back into one `total`-frame signal.
    ///
    /// Window outputs whose length differs from their range are padded with
    /// silence or truncated before blending.
    pub fn stitch(&self, total: usize, ranges: &[Range<usize>], parts: &[Vec<f32>]) -> Vec<f32> {
        let mut out = vec![0.0f32; total];
        let mut weight_sum = vec![0.0f32; total];
        let last = ranges.len().saturating_sub(1);

        for (index, (range, part)) in ranges.iter().zip(parts).enumerate() {
            let len = range.len();
            let fade_in = if index == 0 { 0 } else { self.overlap_frames.min(len) };
            let fade_out = if index == last { 0 } else { self.overlap_frames.min(len) };

            for i in 0..len {
                let mut w = 1.0f32;
                if i < fade_in {
                    w *= (i + 1) as f32 / (fade_in + 1) as f32;
                }
                if i >= len - fade_out {
                    let j = i - (len - fade_out);
                    w *= (fade_out - j) as f32 / (fade_out + 1) as f32;
                }

                let sample = part.get(i).copied().unwrap_or(0.0);
                out[range.start + i] += sample * w;
                weight_sum[range.start + i] += w;
            }
        }

        for (sample, w) in out.iter_mut().zip(&weight_sum) {
            if *w > 1e-8 {
                *sample /= *w;
            }
        }
        out
    }
}
