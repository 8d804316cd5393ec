//! # Audio I/O
//!
//! Everything that touches audio bytes on disk lives here:
//! - **decode**: uploads in any supported container → mono `f32` at the model rate
//! - **wav**: separated stems → 16-bit PCM WAV, written atomically
//!
//! The separation model only ever sees mono samples at its own sample rate;
//! the conversion happens once, in `SeparationModel::prepare`.

pub mod decode;
pub mod wav;

use std::fmt;
use std::path::PathBuf;

/// Mono samples together with the rate they were captured at.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Failures while reading or writing audio files.
#[derive(Debug)]
pub enum AudioError {
    /// The file could not be opened, probed or decoded
    Decode { path: PathBuf, reason: String },
    /// The file could not be written or moved into place
    Encode { path: PathBuf, reason: String },
    /// Sample-rate conversion failed
    Resample(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::Decode { path, reason } => {
                write!(f, "Cannot decode {}: {}", path.display(), reason)
            }
            AudioError::Encode { path, reason } => {
                write!(f, "Cannot write {}: {}", path.display(), reason)
            }
            AudioError::Resample(reason) => write!(f, "Resampling failed: {}", reason),
        }
    }
}

impl std::error::Error for AudioError {}
