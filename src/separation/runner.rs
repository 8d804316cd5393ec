//! # Hub Runner Backend
//!
//! Production separation backend. Loading resolves the pretrained model from
//! the Hugging Face Hub; inference is delegated to an external runner program
//! that reads and writes WAV files.
//!
//! ## Loading Process:
//! 1. Build a Hub API client from `HF_TOKEN` / `HF_HUB_CACHE` / `HF_HOME`
//! 2. Download the configured model files (cached locally after the first run)
//! 3. Read the model's sample rate from `config.json`
//! 4. Resolve the compute device
//!
//! ## Runner Protocol:
//! ```text
//! <program> <args..> --model-dir D --device DEV --sample-rate SR \
//!     --input in.wav --description TEXT --target t.wav --residual r.wav
//! ```
//! The runner must exit 0 and write both WAVs at `SR`. It may print a final
//! stdout line `{"peak_memory_gb": 3.2}` to report memory use. A runner still
//! alive when the request deadline passes is killed.

use super::backend::{BackendError, Deadline, ModelLoader, PreparedBatch, Separation, SeparationModel};
use crate::audio::wav::{read_wav, write_wav};
use crate::config::ModelConfig;
use crate::device::device_from_string;
use futures_util::future::BoxFuture;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Characters of runner stderr kept in error messages
const STDERR_TAIL: usize = 800;

/// How often a running runner is checked for exit
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Loads a model snapshot from the Hub and wraps it in a [`RunnerModel`].
pub struct HubLoader {
    config: ModelConfig,
}

impl HubLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Download every configured file and return the snapshot directory.
    async fn fetch_snapshot(&self) -> Result<PathBuf, BackendError> {
        debug!("HF_HOME: {:?}", std::env::var("HF_HOME"));
        debug!("HF_HUB_CACHE: {:?}", std::env::var("HF_HUB_CACHE"));
        debug!("HF_TOKEN: {:?}", std::env::var("HF_TOKEN").map(|_| "***SET***"));

        let mut builder = ApiBuilder::new().with_token(std::env::var("HF_TOKEN").ok());
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let api = builder
            .with_progress(false)
            .build()
            .map_err(|e| BackendError::Load(format!("Cannot create Hub client: {}", e)))?;

        let repo = api.repo(Repo::with_revision(
            self.config.model_id.clone(),
            RepoType::Model,
            self.config.revision.clone(),
        ));

        let mut snapshot_dir = None;
        let files = std::iter::once("config.json")
            .chain(self.config.files.iter().map(String::as_str).filter(|f| *f != "config.json"));

        for file in files {
            let path = repo.get(file).await.map_err(|e| {
                BackendError::Load(format!(
                    "Failed to download {} from {}: {}",
                    file, self.config.model_id, e
                ))
            })?;
            debug!("Fetched {} to {:?}", file, path);

            if snapshot_dir.is_none() {
                snapshot_dir = path.parent().map(Path::to_path_buf);
            }
        }

        snapshot_dir.ok_or_else(|| BackendError::Load("Hub returned a path without a parent directory".to_string()))
    }
}

impl ModelLoader for HubLoader {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn SeparationModel>, BackendError>> {
        Box::pin(async move {
            info!("Loading separation model {} ({})", self.config.model_id, self.config.revision);
            let start = Instant::now();

            let model_dir = self.fetch_snapshot().await?;
            let sample_rate = read_model_sample_rate(&model_dir.join("config.json"), self.config.default_sample_rate)?;

            let preference = self.config.device.clone();
            let device = tokio::task::spawn_blocking(move || device_from_string(&preference))
                .await
                .map_err(|e| BackendError::Load(format!("Device detection failed: {}", e)))?;

            info!(
                "Model snapshot ready in {:.2}s: {:?} @ {}Hz on {}",
                start.elapsed().as_secs_f64(),
                model_dir,
                sample_rate,
                device
            );

            let model = RunnerModel::new(
                self.config.runner_program.clone(),
                self.config.runner_args.clone(),
                model_dir,
                device,
                sample_rate,
            );
            Ok(Arc::new(model) as Arc<dyn SeparationModel>)
        })
    }
}

#[derive(Debug, Deserialize)]
struct ModelAudioConfig {
    sample_rate: Option<u32>,
    sampling_rate: Option<u32>,
}

/// Sample rate declared by the model's `config.json`, or `default`.
pub fn read_model_sample_rate(config_path: &Path, default: u32) -> Result<u32, BackendError> {
    let text = std::fs::read_to_string(config_path)
        .map_err(|e| BackendError::Load(format!("Cannot read {}: {}", config_path.display(), e)))?;
    let parsed: ModelAudioConfig = serde_json::from_str(&text)
        .map_err(|e| BackendError::Load(format!("Invalid {}: {}", config_path.display(), e)))?;

    match parsed.sample_rate.or(parsed.sampling_rate) {
        Some(rate) if rate > 0 => Ok(rate),
        _ => {
            warn!("No sample rate in model config, using default {}Hz", default);
            Ok(default)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunnerReport {
    peak_memory_gb: Option<f64>,
}

/// Peak memory from the last JSON line the runner printed, if any.
pub fn parse_runner_report(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<RunnerReport>(line).ok())
        .and_then(|report| report.peak_memory_gb)
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = text.char_indices().nth(count - max_chars).map(|(i, _)| i).unwrap_or(0);
    &text[skip..]
}

/// Pad with silence or truncate to exactly `frames`.
fn fit_length(mut samples: Vec<f32>, frames: usize) -> Vec<f32> {
    samples.resize(frames, 0.0);
    samples
}

fn log_file(path: &Path) -> Result<File, BackendError> {
    File::create(path).map_err(|e| BackendError::Processing(format!("Cannot create {}: {}", path.display(), e)))
}

/// Poll `child` until it exits, killing it once `deadline` passes.
fn wait_until(child: &mut std::process::Child, deadline: Deadline, start: Instant) -> Result<ExitStatus, BackendError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if deadline.expired() => {
                warn!("Runner still busy after {:.1}s, killing it", start.elapsed().as_secs_f64());
                if let Err(e) = child.kill() {
                    warn!("Failed to kill runner: {}", e);
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap runner: {}", e);
                }
                return Err(BackendError::TimedOut(format!(
                    "runner killed after {:.1}s",
                    start.elapsed().as_secs_f64()
                )));
            }
            Ok(None) => {
                let nap = deadline.remaining().map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));
                std::thread::sleep(nap);
            }
            Err(e) => return Err(BackendError::Processing(format!("Lost track of runner: {}", e))),
        }
    }
}

/// Separation model driven by an external runner process.
pub struct RunnerModel {
    program: String,
    args: Vec<String>,
    model_dir: PathBuf,
    device: String,
    sample_rate: u32,
}

impl RunnerModel {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        model_dir: PathBuf,
        device: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            model_dir,
            device: device.into(),
            sample_rate,
        }
    }

    /// Run the runner once over `samples`; returns (target, residual, peak memory).
    fn run_once(
        &self,
        description: &str,
        samples: &[f32],
        deadline: Deadline,
    ) -> Result<(Vec<f32>, Vec<f32>, Option<f64>), BackendError> {
        deadline.check()?;

        let scratch = tempfile::Builder::new()
            .prefix("isolate-")
            .tempdir()
            .map_err(|e| BackendError::Processing(format!("Cannot create scratch directory: {}", e)))?;

        let input = scratch.path().join("input.wav");
        let target = scratch.path().join("target.wav");
        let residual = scratch.path().join("residual.wav");
        let stdout_log = scratch.path().join("stdout.log");
        let stderr_log = scratch.path().join("stderr.log");

        write_wav(&input, samples, self.sample_rate).map_err(|e| BackendError::Processing(e.to_string()))?;

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--model-dir")
            .arg(&self.model_dir)
            .arg("--device")
            .arg(&self.device)
            .arg("--sample-rate")
            .arg(self.sample_rate.to_string())
            .arg("--input")
            .arg(&input)
            .arg("--description")
            .arg(description)
            .arg("--target")
            .arg(&target)
            .arg("--residual")
            .arg(&residual)
            .stdin(Stdio::null())
            .stdout(log_file(&stdout_log)?)
            .stderr(log_file(&stderr_log)?)
            .spawn()
            .map_err(|e| BackendError::Processing(format!("Failed to start runner '{}': {}", self.program, e)))?;

        let status = wait_until(&mut child, deadline, start)?;

        let stderr = std::fs::read_to_string(&stderr_log).unwrap_or_default();
        if !stderr.trim().is_empty() {
            debug!("Runner stderr: {}", tail(stderr.trim(), STDERR_TAIL));
        }

        if !status.success() {
            return Err(BackendError::Processing(format!(
                "Runner exited with {}: {}",
                status,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        debug!(
            "Runner finished {} frames in {:.2}s",
            samples.len(),
            start.elapsed().as_secs_f64()
        );

        let stdout = std::fs::read_to_string(&stdout_log).unwrap_or_default();
        let peak = parse_runner_report(&stdout);
        let target = self.read_stem(&target)?;
        let residual = self.read_stem(&residual)?;

        Ok((fit_length(target, samples.len()), fit_length(residual, samples.len()), peak))
    }

    fn read_stem(&self, path: &Path) -> Result<Vec<f32>, BackendError> {
        if !path.exists() {
            return Err(BackendError::Processing(format!(
                "Runner did not write {}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or("output")
            )));
        }

        let audio = read_wav(path).map_err(|e| BackendError::Processing(e.to_string()))?;
        if audio.sample_rate != self.sample_rate {
            return Err(BackendError::Processing(format!(
                "Runner wrote {}Hz audio, expected {}Hz",
                audio.sample_rate, self.sample_rate
            )));
        }
        Ok(audio.samples)
    }
}

impl SeparationModel for RunnerModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn prepare(&self, descriptions: &[String], audio_paths: &[PathBuf]) -> Result<PreparedBatch, BackendError> {
        PreparedBatch::from_files(descriptions, audio_paths, self.sample_rate)
    }

    fn separate_whole(&self, batch: &PreparedBatch, deadline: Deadline) -> Result<Separation, BackendError> {
        let mut out = Separation::default();
        for item in &batch.items {
            let (target, residual, peak) = self.run_once(&item.description, &item.samples, deadline)?;
            out.target.push(target);
            out.residual.push(residual);
            out.peak_memory_gb = super::backend::max_peak(out.peak_memory_gb, peak);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separation::backend::PreparedItem;
    use tempfile::tempdir;

    #[test]
    fn test_parse_runner_report() {
        assert_eq!(parse_runner_report("loading...\n{\"peak_memory_gb\": 3.5}\n"), Some(3.5));
        assert_eq!(parse_runner_report("{\"peak_memory_gb\": 1.0}\ndone\n"), Some(1.0));
        assert_eq!(parse_runner_report("no report here"), None);
        assert_eq!(parse_runner_report("{\"other\": true}"), None);
        assert_eq!(parse_runner_report("{not json"), None);
    }

    #[test]
    fn test_read_model_sample_rate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"sample_rate": 48000, "hidden_size": 1024}"#).unwrap();
        assert_eq!(read_model_sample_rate(&path, 24_000).unwrap(), 48_000);

        std::fs::write(&path, r#"{"sampling_rate": 16000}"#).unwrap();
        assert_eq!(read_model_sample_rate(&path, 24_000).unwrap(), 16_000);

        std::fs::write(&path, r#"{"hidden_size": 1024}"#).unwrap();
        assert_eq!(read_model_sample_rate(&path, 24_000).unwrap(), 24_000);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(read_model_sample_rate(&path, 24_000), Err(BackendError::Load(_))));
    }

    #[test]
    fn test_tail_keeps_end_of_text() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdefghij", 3), "hij");
        assert_eq!(tail("ééééé", 2), "éé");
    }

    fn batch(frames: usize) -> PreparedBatch {
        PreparedBatch {
            sample_rate: 8_000,
            items: vec![PreparedItem {
                description: "dog barking".to_string(),
                source_path: PathBuf::from("clip.wav"),
                samples: (0..frames).map(|i| ((i % 50) as f32 / 50.0) - 0.5).collect(),
            }],
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("runner.sh");
        std::fs::write(&script, body).unwrap();
        script
    }

    #[cfg(unix)]
    const COPY_RUNNER: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --input) input="$2"; shift 2 ;;
    --target) target="$2"; shift 2 ;;
    --residual) residual="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cp "$input" "$target"
cp "$input" "$residual"
echo '{"peak_memory_gb": 1.25}'
"#;

    #[cfg(unix)]
    #[test]
    fn test_runner_roundtrip_through_process() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), COPY_RUNNER);
        let model = RunnerModel::new("sh", vec![script.display().to_string()], dir.path().to_path_buf(), "cpu", 8_000);

        let input = batch(4_000);
        let out = model.separate_whole(&input, Deadline::none()).unwrap();

        assert_eq!(out.peak_memory_gb, Some(1.25));
        assert_eq!(out.target[0].len(), 4_000);
        assert_eq!(out.residual[0].len(), 4_000);
        for (a, b) in out.target[0].iter().zip(&input.items[0].samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_chunked_uses_windows() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), COPY_RUNNER);
        let model = RunnerModel::new("sh", vec![script.display().to_string()], dir.path().to_path_buf(), "cpu", 8_000);

        let out = model.separate_chunked(&batch(20_000), 1.0, 0.25, Deadline::none()).unwrap();
        assert_eq!(out.target[0].len(), 20_000);
        assert_eq!(out.peak_memory_gb, Some(1.25));
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_failure_is_processing_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'out of memory' >&2\nexit 3\n");
        let model = RunnerModel::new("sh", vec![script.display().to_string()], dir.path().to_path_buf(), "cpu", 8_000);

        match model.separate_whole(&batch(100), Deadline::none()) {
            Err(BackendError::Processing(msg)) => assert!(msg.contains("out of memory")),
            other => panic!("expected processing error, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_missing_outputs_is_processing_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0\n");
        let model = RunnerModel::new("sh", vec![script.display().to_string()], dir.path().to_path_buf(), "cpu", 8_000);

        assert!(matches!(model.separate_whole(&batch(100), Deadline::none()), Err(BackendError::Processing(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_runner_is_killed_at_deadline() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 30\n");
        let model = RunnerModel::new("sh", vec![script.display().to_string()], dir.path().to_path_buf(), "cpu", 8_000);

        let start = Instant::now();
        let result = model.separate_whole(&batch(100), Deadline::after(Duration::from_millis(200)));
        assert!(matches!(result, Err(BackendError::TimedOut(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_program_is_processing_error() {
        let dir = tempdir().unwrap();
        let model = RunnerModel::new(
            "definitely-not-a-real-runner-binary",
            Vec::new(),
            dir.path().to_path_buf(),
            "cpu",
            8_000,
        );
        assert!(matches!(model.separate_whole(&batch(100), Deadline::none()), Err(BackendError::Processing(_))));
    }
}
