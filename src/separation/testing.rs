//! In-process test backend.
//!
//! `FakeLoader` counts how often it initialises and can be told to fail its
//! first loads. `FakeModel` splits every clip into a half-gain target and the
//! matching residual, and records how many separations overlap in time. It can
//! also be told to hang until its deadline, like a stuck runner.

use super::backend::{BackendError, Deadline, ModelLoader, PreparedBatch, Separation, SeparationModel};
use futures_util::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAKE_SAMPLE_RATE: u32 = 8_000;

/// Shared counters a test can inspect after handing the loader away.
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub loads: AtomicUsize,
    pub separations: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub fail_separation: AtomicBool,
    /// Upcoming separations that hang until their deadline
    pub stalls: AtomicUsize,
}

/// Longest a stalled separation hangs when it has no deadline
const STALL_LIMIT: Duration = Duration::from_secs(30);

pub struct FakeLoader {
    pub probe: Arc<FakeProbe>,
    failures_left: AtomicUsize,
    load_delay: Duration,
    separation_delay: Duration,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(FakeProbe::default()),
            failures_left: AtomicUsize::new(0),
            load_delay: Duration::from_millis(20),
            separation_delay: Duration::ZERO,
        }
    }

    /// Fail the next `count` loads.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make every separation block for `delay`.
    pub fn with_separation_delay(mut self, delay: Duration) -> Self {
        self.separation_delay = delay;
        self
    }
}

impl ModelLoader for FakeLoader {
    fn model_id(&self) -> &str {
        "test/fake-separator"
    }

    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn SeparationModel>, BackendError>> {
        Box::pin(async move {
            tokio::time::sleep(self.load_delay).await;
            self.probe.loads.fetch_add(1, Ordering::SeqCst);

            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(BackendError::Load("simulated download failure".to_string()));
            }

            Ok(Arc::new(FakeModel {
                probe: self.probe.clone(),
                delay: self.separation_delay,
            }) as Arc<dyn SeparationModel>)
        })
    }
}

pub struct FakeModel {
    probe: Arc<FakeProbe>,
    delay: Duration,
}

impl SeparationModel for FakeModel {
    fn sample_rate(&self) -> u32 {
        FAKE_SAMPLE_RATE
    }

    fn prepare(&self, descriptions: &[String], audio_paths: &[PathBuf]) -> Result<PreparedBatch, BackendError> {
        PreparedBatch::from_files(descriptions, audio_paths, FAKE_SAMPLE_RATE)
    }

    fn separate_whole(&self, batch: &PreparedBatch, deadline: Deadline) -> Result<Separation, BackendError> {
        let probe = &self.probe;
        let now_active = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_active.fetch_max(now_active, Ordering::SeqCst);
        probe.separations.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let stalled = probe
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            std::thread::sleep(deadline.remaining().map_or(STALL_LIMIT, |left| left.min(STALL_LIMIT)));
        }

        let result: Result<Separation, BackendError> = if stalled {
            deadline
                .check()
                .and(Err(BackendError::Processing("stalled separation".to_string())))
        } else if probe.fail_separation.load(Ordering::SeqCst) {
            Err(BackendError::Processing("simulated inference failure".to_string()))
        } else {
            let mut out = Separation::default();
            for item in &batch.items {
                let target: Vec<f32> = item.samples.iter().map(|s| s * 0.5).collect();
                let residual: Vec<f32> = item.samples.iter().zip(&target).map(|(s, t)| s - t).collect();
                out.target.push(target);
                out.residual.push(residual);
            }
            out.peak_memory_gb = Some(0.5);
            Ok(out)
        };

        probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Write a short test tone as WAV and return its path.
pub fn write_tone(dir: &std::path::Path, name: &str, seconds: f32, sample_rate: u32) -> PathBuf {
    let frames = (seconds * sample_rate as f32) as usize;
    let samples: Vec<f32> = (0..frames)
        .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sample_rate as f32).sin() * 0.4)
        .collect();
    let path = dir.join(name);
    crate::audio::wav::write_wav(&path, &samples, sample_rate).expect("write test tone");
    path
}
