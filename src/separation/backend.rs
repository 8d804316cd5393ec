//! # Separation Backend Contract
//!
//! The orchestrator never talks to a concrete model. It goes through two traits:
//!
//! - **`ModelLoader`**: produces a ready model, asynchronously (downloads, warm-up)
//! - **`SeparationModel`**: prepares inputs and runs separation, synchronously
//!
//! Separation calls are blocking and compute-heavy; the orchestrator runs them
//! on the blocking thread pool, one at a time.
//!
//! Chunked separation has a default implementation built on `separate_whole`
//! and the window planner, so a backend only has to know how to process one
//! contiguous clip.
//!
//! Every separation call carries a [`Deadline`]. Backends must give up and
//! return [`BackendError::TimedOut`] once it passes, so a stuck call cannot
//! hold the separation slot forever.

use super::window::WindowPlan;
use crate::audio::decode::decode_at_rate;
use futures_util::future::BoxFuture;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Failures reported by a backend.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// The model could not be fetched or initialised
    Load(String),
    /// The input audio or request parameters were unusable
    Input(String),
    /// Inference itself failed
    Processing(String),
    /// The call ran past its deadline and was abandoned
    TimedOut(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Load(msg) => write!(f, "Model load failed: {}", msg),
            BackendError::Input(msg) => write!(f, "Invalid input: {}", msg),
            BackendError::Processing(msg) => write!(f, "Separation failed: {}", msg),
            BackendError::TimedOut(msg) => write!(f, "Separation timed out: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Point in time by which a separation call has to return.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No time limit.
    #[cfg(test)]
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    /// Time left, or `None` when unbounded. Zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    pub fn check(&self) -> Result<(), BackendError> {
        if self.expired() {
            return Err(BackendError::TimedOut("deadline passed".to_string()));
        }
        Ok(())
    }
}

/// One decoded clip paired with its description.
#[derive(Debug, Clone)]
pub struct PreparedItem {
    pub description: String,
    pub source_path: PathBuf,
    /// Mono samples at the batch sample rate
    pub samples: Vec<f32>,
}

/// Model-ready input: every item is mono at `sample_rate`.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub sample_rate: u32,
    pub items: Vec<PreparedItem>,
}

impl PreparedBatch {
    /// Decode each file and resample it to `sample_rate`.
    ///
    /// `descriptions` and `audio_paths` are paired by position.
    pub fn from_files(
        descriptions: &[String],
        audio_paths: &[PathBuf],
        sample_rate: u32,
    ) -> Result<Self, BackendError> {
        if descriptions.len() != audio_paths.len() {
            return Err(BackendError::Input(format!(
                "{} descriptions for {} audio files",
                descriptions.len(),
                audio_paths.len()
            )));
        }

        let items = descriptions
            .iter()
            .zip(audio_paths)
            .map(|(description, path)| {
                let audio = decode_at_rate(path, sample_rate)
                    .map_err(|e| BackendError::Input(e.to_string()))?;
                Ok(PreparedItem {
                    description: description.clone(),
                    source_path: path.clone(),
                    samples: audio.samples,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(Self { sample_rate, items })
    }

    /// Single-item batch carrying a slice of an existing item.
    pub fn window_of(&self, item: &PreparedItem, samples: Vec<f32>) -> Self {
        Self {
            sample_rate: self.sample_rate,
            items: vec![PreparedItem {
                description: item.description.clone(),
                source_path: item.source_path.clone(),
                samples,
            }],
        }
    }
}

/// Separated stems, one pair per batch item, at the batch sample rate.
#[derive(Debug, Clone, Default)]
pub struct Separation {
    pub target: Vec<Vec<f32>>,
    pub residual: Vec<Vec<f32>>,
    /// Reported by backends that can measure it
    pub peak_memory_gb: Option<f64>,
}

impl Separation {
    /// Take the stems of the first (and only) item.
    pub fn into_single(self) -> Result<(Vec<f32>, Vec<f32>), BackendError> {
        let target = self.target.into_iter().next();
        let residual = self.residual.into_iter().next();
        match (target, residual) {
            (Some(t), Some(r)) => Ok((t, r)),
            _ => Err(BackendError::Processing("Backend returned no stems".to_string())),
        }
    }
}

/// Larger of two optional peak-memory readings.
pub fn max_peak(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// A loaded, ready-to-run separation model.
pub trait SeparationModel: Send + Sync {
    /// Rate every prepared input and every output stem uses
    fn sample_rate(&self) -> u32;

    /// Compute device the model runs on ("cpu", "cuda", "metal")
    fn device(&self) -> &str {
        "cpu"
    }

    /// Decode and resample inputs into a model-ready batch.
    fn prepare(&self, descriptions: &[String], audio_paths: &[PathBuf]) -> Result<PreparedBatch, BackendError>;

    /// Separate each item in one pass over the whole clip.
    fn separate_whole(&self, batch: &PreparedBatch, deadline: Deadline) -> Result<Separation, BackendError>;

    /// Separate each item window by window and cross-fade the results.
    ///
    /// Output stems have exactly as many frames as the prepared input.
    fn separate_chunked(
        &self,
        batch: &PreparedBatch,
        chunk_seconds: f64,
        overlap_seconds: f64,
        deadline: Deadline,
    ) -> Result<Separation, BackendError> {
        let plan = WindowPlan::from_seconds(chunk_seconds, overlap_seconds, batch.sample_rate)?;

        let mut out = Separation::default();
        for item in &batch.items {
            let total = item.samples.len();
            let ranges = plan.windows(total);
            debug!(
                "Chunked separation of {} frames in {} windows ({} frame stride)",
                total,
                ranges.len(),
                plan.stride()
            );

            let mut target_parts = Vec::with_capacity(ranges.len());
            let mut residual_parts = Vec::with_capacity(ranges.len());
            for range in &ranges {
                deadline.check()?;
                let window = batch.window_of(item, item.samples[range.clone()].to_vec());
                let separated = self.separate_whole(&window, deadline)?;
                out.peak_memory_gb = max_peak(out.peak_memory_gb, separated.peak_memory_gb);

                let (target, residual) = separated.into_single()?;
                target_parts.push(target);
                residual_parts.push(residual);
            }

            out.target.push(plan.stitch(total, &ranges, &target_parts));
            out.residual.push(plan.stitch(total, &ranges, &residual_parts));
        }

        Ok(out)
    }
}

/// Produces a loaded model. Called at most once at a time by the orchestrator.
pub trait ModelLoader: Send + Sync {
    /// Identifier reported on the status endpoint
    fn model_id(&self) -> &str;

    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn SeparationModel>, BackendError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::write_wav;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Halves every sample and counts calls.
    struct Halver {
        calls: AtomicUsize,
    }

    impl SeparationModel for Halver {
        fn sample_rate(&self) -> u32 {
            1_000
        }

        fn prepare(&self, descriptions: &[String], audio_paths: &[PathBuf]) -> Result<PreparedBatch, BackendError> {
            PreparedBatch::from_files(descriptions, audio_paths, self.sample_rate())
        }

        fn separate_whole(&self, batch: &PreparedBatch, _deadline: Deadline) -> Result<Separation, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = Separation::default();
            for item in &batch.items {
                let half: Vec<f32> = item.samples.iter().map(|s| s * 0.5).collect();
                out.residual.push(half.clone());
                out.target.push(half);
            }
            out.peak_memory_gb = Some(item_peak(batch));
            Ok(out)
        }
    }

    fn item_peak(batch: &PreparedBatch) -> f64 {
        batch.items[0].samples.len() as f64 / 1_000.0
    }

    fn batch(frames: usize) -> PreparedBatch {
        PreparedBatch {
            sample_rate: 1_000,
            items: vec![PreparedItem {
                description: "drums".to_string(),
                source_path: PathBuf::from("clip.wav"),
                samples: (0..frames).map(|i| (i as f32 * 0.01).sin()).collect(),
            }],
        }
    }

    #[test]
    fn test_chunked_matches_input_length() {
        let model = Halver { calls: AtomicUsize::new(0) };
        let input = batch(4_321);

        let out = model.separate_chunked(&input, 1.0, 0.25, Deadline::none()).unwrap();
        assert_eq!(out.target[0].len(), 4_321);
        assert_eq!(out.residual[0].len(), 4_321);
        assert!(model.calls.load(Ordering::SeqCst) > 1);

        // A linear model is reproduced exactly by the cross-fade
        for (got, original) in out.target[0].iter().zip(&input.items[0].samples) {
            assert!((got - original * 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_chunked_reports_largest_window_peak() {
        let model = Halver { calls: AtomicUsize::new(0) };
        let out = model.separate_chunked(&batch(2_500), 1.0, 0.5, Deadline::none()).unwrap();
        assert_eq!(out.peak_memory_gb, Some(1.0));
    }

    #[test]
    fn test_chunked_short_clip_is_one_call() {
        let model = Halver { calls: AtomicUsize::new(0) };
        model.separate_chunked(&batch(300), 1.0, 0.25, Deadline::none()).unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_from_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_wav(&path, &vec![0.25; 2_000], 2_000).unwrap();

        let batch = PreparedBatch::from_files(&["bass".to_string()], &[path.clone()], 1_000).unwrap();
        assert_eq!(batch.sample_rate, 1_000);
        assert_eq!(batch.items[0].samples.len(), 1_000);
        assert_eq!(batch.items[0].source_path, path);

        let mismatch = PreparedBatch::from_files(&[], &[path], 1_000);
        assert!(matches!(mismatch, Err(BackendError::Input(_))));
    }

    #[test]
    fn test_chunked_stops_at_expired_deadline() {
        let model = Halver { calls: AtomicUsize::new(0) };
        let expired = Deadline::after(Duration::ZERO);
        assert!(expired.expired());

        let result = model.separate_chunked(&batch(4_000), 1.0, 0.25, expired);
        assert!(matches!(result, Err(BackendError::TimedOut(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deadline_remaining() {
        assert_eq!(Deadline::none().remaining(), None);
        assert!(!Deadline::none().expired());
        assert!(Deadline::after(Duration::from_secs(60)).remaining().unwrap() > Duration::from_secs(59));
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
    }

    #[test]
    fn test_max_peak() {
        assert_eq!(max_peak(None, None), None);
        assert_eq!(max_peak(Some(1.0), None), Some(1.0));
        assert_eq!(max_peak(Some(1.0), Some(2.5)), Some(2.5));
    }
}
