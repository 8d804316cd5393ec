//! # Text-Conditioned Separation
//!
//! Isolates the sound described by a short text prompt ("piano", "dog barking")
//! from an audio file, producing a **target** stem (what was described) and a
//! **residual** stem (everything else).
//!
//! ## Key Components:
//! - **backend**: the contract every separation model satisfies (`ModelLoader`, `SeparationModel`)
//! - **window**: overlapping window planning and cross-fade stitching for long clips
//! - **runner**: production backend: Hub snapshot + external inference runner
//! - **orchestrator**: single-flight loading, serialized dispatch, persistence
//!
//! ## Request Flow:
//! 1. Make sure the model is loaded (one load in flight, ever)
//! 2. Validate the description
//! 3. Decode and resample the clip (`prepare`)
//! 4. Separate whole or chunked, exactly as requested
//! 5. Write `{base}_target.wav` and `{base}_residual.wav`

pub mod backend;
pub mod orchestrator;
pub mod runner;
pub mod window;

#[cfg(test)]
pub mod testing;

pub use orchestrator::{IsolationOrchestrator, OrchestratorSettings};
pub use runner::HubLoader;

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// How the model should walk through the clip.
///
/// The two paths produce numerically different output, so the mode is always
/// the caller's explicit choice and never substituted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeparationMode {
    /// One pass over the entire clip. Memory grows with clip length.
    Whole,
    /// Overlapping windows stitched with cross-fades. Memory is bounded by the window.
    Chunked { chunk_seconds: f64, overlap_seconds: f64 },
}

impl SeparationMode {
    pub fn label(&self) -> &'static str {
        match self {
            SeparationMode::Whole => "whole",
            SeparationMode::Chunked { .. } => "chunked",
        }
    }

    /// Chunk parameters must be positive and the overlap shorter than the chunk.
    pub fn validate(&self) -> Result<(), IsolationError> {
        if let SeparationMode::Chunked { chunk_seconds, overlap_seconds } = *self {
            if !(chunk_seconds > 0.0) || !(overlap_seconds > 0.0) {
                return Err(IsolationError::new(
                    Stage::Validation,
                    "Chunk and overlap durations must be positive",
                ));
            }
            if overlap_seconds >= chunk_seconds {
                return Err(IsolationError::new(
                    Stage::Validation,
                    format!(
                        "Overlap ({}s) must be shorter than the chunk ({}s)",
                        overlap_seconds, chunk_seconds
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// One isolation job.
#[derive(Debug, Clone)]
pub struct IsolationRequest {
    /// Locally readable audio file; never deleted by the orchestrator
    pub source_audio_path: PathBuf,
    /// What to isolate, in plain words
    pub description: String,
    pub mode: SeparationMode,
}

/// Processing details returned alongside the output files.
#[derive(Debug, Clone, Serialize)]
pub struct IsolationMetadata {
    pub sample_rate: u32,
    /// `None` when the backend does not report memory usage
    pub peak_memory_gb: Option<f64>,
    pub description: String,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_seconds: Option<f64>,
    pub duration_seconds: f64,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IsolationResult {
    pub target_path: PathBuf,
    pub residual_path: PathBuf,
    pub metadata: IsolationMetadata,
}

/// Where in the pipeline an isolation request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    ModelLoad,
    Prepare,
    Processing,
    Persist,
    Busy,
    Timeout,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::ModelLoad => "model_load",
            Stage::Prepare => "prepare",
            Stage::Processing => "processing",
            Stage::Persist => "persist",
            Stage::Busy => "busy",
            Stage::Timeout => "timeout",
        }
    }
}

/// Tagged failure returned by the orchestrator instead of panicking.
#[derive(Debug, Clone)]
pub struct IsolationError {
    pub stage: Stage,
    pub detail: String,
}

impl IsolationError {
    pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for IsolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for IsolationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_validation() {
        assert!(SeparationMode::Whole.validate().is_ok());

        let ok = SeparationMode::Chunked { chunk_seconds: 10.0, overlap_seconds: 3.0 };
        assert!(ok.validate().is_ok());

        let zero = SeparationMode::Chunked { chunk_seconds: 0.0, overlap_seconds: 0.0 };
        assert_eq!(zero.validate().unwrap_err().stage, Stage::Validation);

        let wide = SeparationMode::Chunked { chunk_seconds: 2.0, overlap_seconds: 2.0 };
        assert_eq!(wide.validate().unwrap_err().stage, Stage::Validation);

        let nan = SeparationMode::Chunked { chunk_seconds: f64::NAN, overlap_seconds: 1.0 };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_metadata_serializes_missing_peak_memory_as_null() {
        let metadata = IsolationMetadata {
            sample_rate: 24_000,
            peak_memory_gb: None,
            description: "piano".to_string(),
            mode: SeparationMode::Whole.label(),
            chunk_seconds: None,
            overlap_seconds: None,
            duration_seconds: 5.0,
            processing_time_ms: 12,
        };

        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value["peak_memory_gb"].is_null());
        assert_eq!(value["mode"], "whole");
        assert!(value.get("chunk_seconds").is_none());
    }
}
