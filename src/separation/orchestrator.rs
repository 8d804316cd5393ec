//! # Isolation Orchestrator
//!
//! Owns the separation backend for the lifetime of the service and turns one
//! `IsolationRequest` into two WAV files on disk.
//!
//! ## Concurrency:
//! - **Loading** is single-flight: concurrent callers share one in-flight load,
//!   and a failed or timed-out load publishes nothing, so the next caller retries.
//! - **Separation** holds a one-permit semaphore. The permit moves into the
//!   blocking task and is released when compute finishes. The backend gets a
//!   deadline of `separation_timeout` and must abandon the work once it passes,
//!   so a stuck separation frees the permit for the next caller.
//! - **Admission**: at most `max_queued_requests` callers wait for the permit;
//!   anyone beyond that is turned away as busy.

use super::backend::{BackendError, Deadline, ModelLoader, SeparationModel};
use super::window::WindowPlan;
use super::{IsolationError, IsolationMetadata, IsolationRequest, IsolationResult, SeparationMode, Stage};
use crate::audio::wav::write_wav;
use crate::config::AppConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Extra wait past the backend deadline before the caller stops waiting.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the separation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unloaded,
    Loading,
    Loaded,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Unloaded => "unloaded",
            BackendState::Loading => "loading",
            BackendState::Loaded => "loaded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub output_dir: PathBuf,
    /// Reported until a model is loaded
    pub default_sample_rate: u32,
    /// Reported until a model is loaded
    pub device_preference: String,
    pub min_chunk_seconds: f64,
    pub max_queued_requests: usize,
    pub load_timeout: Duration,
    pub separation_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.storage.output_dir.clone(),
            default_sample_rate: config.model.default_sample_rate,
            device_preference: config.model.device.clone(),
            min_chunk_seconds: config.processing.min_chunk_seconds,
            max_queued_requests: config.processing.max_queued_requests,
            load_timeout: config.processing.load_timeout(),
            separation_timeout: config.processing.separation_timeout(),
        }
    }
}

/// Raised while a load is in flight; lowered on drop, including cancellation.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One place in the admission queue; released on drop.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct IsolationOrchestrator {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn SeparationModel>>,
    loading: AtomicBool,
    gate: Arc<Semaphore>,
    waiting: AtomicUsize,
    settings: OrchestratorSettings,
}

impl IsolationOrchestrator {
    pub fn new(loader: Arc<dyn ModelLoader>, settings: OrchestratorSettings) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
            loading: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(1)),
            waiting: AtomicUsize::new(0),
            settings,
        }
    }

    pub fn model_id(&self) -> &str {
        self.loader.model_id()
    }

    pub fn state(&self) -> BackendState {
        if self.model.initialized() {
            BackendState::Loaded
        } else if self.loading.load(Ordering::SeqCst) {
            BackendState::Loading
        } else {
            BackendState::Unloaded
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Model sample rate once loaded, the configured default before that.
    pub fn sample_rate(&self) -> u32 {
        self.model
            .get()
            .map(|m| m.sample_rate())
            .unwrap_or(self.settings.default_sample_rate)
    }

    /// Device the loaded model runs on, or the configured preference.
    pub fn device(&self) -> String {
        self.model
            .get()
            .map(|m| m.device().to_string())
            .unwrap_or_else(|| self.settings.device_preference.clone())
    }

    /// Number of callers currently waiting for the separation permit.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Load the model if needed; concurrent callers share one load.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn SeparationModel>, IsolationError> {
        if let Some(model) = self.model.get() {
            return Ok(model.clone());
        }

        let init = self.model.get_or_try_init(|| async {
            let _flag = LoadingFlag::raise(&self.loading);
            info!("Loading separation model {}", self.loader.model_id());
            let start = Instant::now();

            let model = self.loader.load().await?;
            info!(
                "Separation model loaded in {:.2}s ({}Hz, {})",
                start.elapsed().as_secs_f64(),
                model.sample_rate(),
                model.device()
            );
            Ok::<_, BackendError>(model)
        });

        match tokio::time::timeout(self.settings.load_timeout, init).await {
            Ok(Ok(model)) => Ok(model.clone()),
            Ok(Err(e)) => {
                error!("Model load failed: {}", e);
                Err(IsolationError::new(Stage::ModelLoad, e.to_string()))
            }
            Err(_) => {
                error!("Model load timed out after {:?}", self.settings.load_timeout);
                Err(IsolationError::new(
                    Stage::Timeout,
                    format!("Model load timed out after {}s", self.settings.load_timeout.as_secs()),
                ))
            }
        }
    }

    /// Wait for the separation permit, or refuse if the queue is full.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, IsolationError> {
        if let Ok(permit) = self.gate.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.waiting);
        if ahead >= self.settings.max_queued_requests {
            warn!("Rejecting separation: {} request(s) already queued", ahead);
            return Err(IsolationError::new(
                Stage::Busy,
                "Server is busy with other separations, try again later",
            ));
        }

        debug!("Queued behind running separation ({} ahead)", ahead);
        match tokio::time::timeout(self.settings.separation_timeout, self.gate.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(IsolationError::new(Stage::Processing, "Separation queue closed")),
            Err(_) => Err(IsolationError::new(
                Stage::Timeout,
                "Timed out waiting for a running separation to finish",
            )),
        }
    }

    /// Chunks must meet the configured minimum and span whole frames at the
    /// model rate, so bad parameters never reach the backend.
    fn check_chunking(&self, mode: SeparationMode, sample_rate: u32) -> Result<(), IsolationError> {
        let SeparationMode::Chunked {
            chunk_seconds,
            overlap_seconds,
        } = mode
        else {
            return Ok(());
        };

        if chunk_seconds < self.settings.min_chunk_seconds {
            return Err(IsolationError::new(
                Stage::Validation,
                format!(
                    "Chunk ({}s) is shorter than the minimum ({}s)",
                    chunk_seconds, self.settings.min_chunk_seconds
                ),
            ));
        }

        WindowPlan::from_seconds(chunk_seconds, overlap_seconds, sample_rate)
            .map(|_| ())
            .map_err(|e| IsolationError::new(Stage::Validation, e.to_string()))
    }

    /// Run one isolation request end to end.
    pub async fn isolate(&self, request: IsolationRequest) -> Result<IsolationResult, IsolationError> {
        let started = Instant::now();
        let model = self.ensure_loaded().await?;

        let description = request.description.trim().to_string();
        if description.is_empty() {
            return Err(IsolationError::new(Stage::Validation, "Description must not be empty"));
        }
        request.mode.validate()?;
        self.check_chunking(request.mode, model.sample_rate())?;

        let permit = self.admit().await?;

        let job = Job {
            source: request.source_audio_path,
            description,
            mode: request.mode,
            output_dir: self.settings.output_dir.clone(),
            deadline: Deadline::after(self.settings.separation_timeout),
        };

        info!(
            "Separating {:?} ({} mode): \"{}\"",
            job.source,
            job.mode.label(),
            job.description
        );

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job.run(model.as_ref())
        });

        let wait = self.settings.separation_timeout + DEADLINE_GRACE;
        let mut result = match tokio::time::timeout(wait, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                error!("Separation task panicked: {}", join_error);
                return Err(IsolationError::new(Stage::Processing, "Separation failed unexpectedly"));
            }
            Err(_) => {
                error!("Separation timed out after {:?}", self.settings.separation_timeout);
                return Err(IsolationError::new(
                    Stage::Timeout,
                    format!("Separation timed out after {}s", self.settings.separation_timeout.as_secs()),
                ));
            }
        };

        result.metadata.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            "Isolation finished in {}ms: {:?}, {:?} (peak memory: {:?} GB)",
            result.metadata.processing_time_ms,
            result.target_path,
            result.residual_path,
            result.metadata.peak_memory_gb
        );
        Ok(result)
    }
}

/// Output paths for a source file: `{base}_target.wav`, `{base}_residual.wav`.
pub fn output_paths(output_dir: &Path, source: &Path) -> (PathBuf, PathBuf) {
    let base = source
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("audio");
    (
        output_dir.join(format!("{}_target.wav", base)),
        output_dir.join(format!("{}_residual.wav", base)),
    )
}

/// Work executed on the blocking pool while holding the separation permit.
struct Job {
    source: PathBuf,
    description: String,
    mode: SeparationMode,
    output_dir: PathBuf,
    deadline: Deadline,
}

impl Job {
    fn run(&self, model: &dyn SeparationModel) -> Result<IsolationResult, IsolationError> {
        let sample_rate = model.sample_rate();

        let batch = model
            .prepare(std::slice::from_ref(&self.description), std::slice::from_ref(&self.source))
            .map_err(|e| IsolationError::new(Stage::Prepare, e.to_string()))?;
        let frames = batch.items.first().map(|item| item.samples.len()).unwrap_or(0);

        let separation = match self.mode {
            SeparationMode::Whole => model.separate_whole(&batch, self.deadline),
            SeparationMode::Chunked {
                chunk_seconds,
                overlap_seconds,
            } => model.separate_chunked(&batch, chunk_seconds, overlap_seconds, self.deadline),
        }
        .map_err(|e| match e {
            BackendError::TimedOut(_) => {
                warn!("Backend abandoned separation at its deadline: {}", e);
                IsolationError::new(Stage::Timeout, e.to_string())
            }
            _ => IsolationError::new(Stage::Processing, e.to_string()),
        })?;

        let peak_memory_gb = separation.peak_memory_gb;
        let (target, residual) = separation
            .into_single()
            .map_err(|e| IsolationError::new(Stage::Processing, e.to_string()))?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            IsolationError::new(
                Stage::Persist,
                format!("Cannot create output directory {}: {}", self.output_dir.display(), e),
            )
        })?;

        let (target_path, residual_path) = output_paths(&self.output_dir, &self.source);
        write_wav(&target_path, &target, sample_rate)
            .map_err(|e| IsolationError::new(Stage::Persist, e.to_string()))?;
        if let Err(e) = write_wav(&residual_path, &residual, sample_rate) {
            if let Err(cleanup) = std::fs::remove_file(&target_path) {
                warn!("Failed to remove orphaned {:?}: {}", target_path, cleanup);
            }
            return Err(IsolationError::new(Stage::Persist, e.to_string()));
        }

        let (chunk_seconds, overlap_seconds) = match self.mode {
            SeparationMode::Whole => (None, None),
            SeparationMode::Chunked {
                chunk_seconds,
                overlap_seconds,
            } => (Some(chunk_seconds), Some(overlap_seconds)),
        };

        Ok(IsolationResult {
            target_path,
            residual_path,
            metadata: IsolationMetadata {
                sample_rate,
                peak_memory_gb,
                description: self.description.clone(),
                mode: self.mode.label(),
                chunk_seconds,
                overlap_seconds,
                duration_seconds: frames as f64 / sample_rate as f64,
                processing_time_ms: 0,
            },
        })
    }
}
