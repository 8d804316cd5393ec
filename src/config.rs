//! # Configuration Management
//!
//! Loads the service configuration from multiple sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary's working directory
//! - Environment variables prefixed with `ISOLATOR_` (nested keys use `__`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`ISOLATOR_SERVER__PORT`, `ISOLATOR_MODEL__MODEL_ID`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
///
/// Grouped by concern so each component only needs to look at its own section:
/// the HTTP layer reads `server` and `storage`, the orchestrator reads `model`
/// and `processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Separation model settings.
///
/// ## Fields:
/// - `model_id`: Hugging Face repository holding the pretrained weights
/// - `revision`: branch, tag or commit of that repository
/// - `files`: files fetched into the local snapshot (`config.json` is always fetched)
/// - `default_sample_rate`: reported until the model is loaded and declares its own
/// - `device`: compute device preference handed to the runner ("auto", "cpu", "cuda", "metal")
/// - `runner_program` / `runner_args`: external inference program and its leading arguments
/// - `preload`: load the model during startup instead of on first use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub revision: String,
    pub files: Vec<String>,
    pub default_sample_rate: u32,
    pub device: String,
    pub runner_program: String,
    pub runner_args: Vec<String>,
    pub preload: bool,
}

/// Where uploads are staged and results are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_upload_mb: u64,
}

/// Chunking defaults, queueing and timeouts for separation work.
///
/// ## Tuning guidelines:
/// - Larger `overlap_seconds` gives smoother window seams but recomputes more audio
/// - `max_queued_requests` bounds how many callers may wait behind a running separation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub chunk_seconds: f64,
    pub overlap_seconds: f64,
    /// Shortest chunk a request may ask for; bounds runner invocations per clip
    pub min_chunk_seconds: f64,
    pub max_queued_requests: usize,
    pub load_timeout_secs: u64,
    pub separation_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5001,
            },
            model: ModelConfig {
                model_id: "mlx-community/sam-audio-large-fp16".to_string(),
                revision: "main".to_string(),
                files: vec!["config.json".to_string(), "model.safetensors".to_string()],
                default_sample_rate: 24_000,
                device: "auto".to_string(),
                runner_program: "sam-audio-runner".to_string(),
                runner_args: Vec::new(),
                preload: false,
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("uploads"),
                output_dir: PathBuf::from("output"),
                max_upload_mb: 500,
            },
            processing: ProcessingConfig {
                chunk_seconds: 10.0,
                overlap_seconds: 3.0,
                min_chunk_seconds: 1.0,
                max_queued_requests: 4,
                load_timeout_secs: 30 * 60,
                separation_timeout_secs: 60 * 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `ISOLATOR_SERVER__PORT=8080`
    /// - `ISOLATOR_MODEL__RUNNER_PROGRAM=/opt/sam/runner`
    /// - `ISOLATOR_PROCESSING__CHUNK_SECONDS=15`
    /// - `HOST=0.0.0.0` / `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("ISOLATOR")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("model.files")
                    .with_list_parse_key("model.runner_args")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.model.model_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Model id cannot be empty"));
        }

        if self.model.runner_program.trim().is_empty() {
            return Err(anyhow::anyhow!("Runner program cannot be empty"));
        }

        if self.model.default_sample_rate == 0 {
            return Err(anyhow::anyhow!("Default sample rate must be greater than 0"));
        }

        if self.storage.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if !(self.processing.chunk_seconds > 0.0) || !(self.processing.overlap_seconds > 0.0) {
            return Err(anyhow::anyhow!("Chunk and overlap durations must be positive"));
        }

        if self.processing.overlap_seconds >= self.processing.chunk_seconds {
            return Err(anyhow::anyhow!(
                "Overlap ({}s) must be shorter than the chunk ({}s)",
                self.processing.overlap_seconds,
                self.processing.chunk_seconds
            ));
        }

        if !(self.processing.min_chunk_seconds > 0.0) {
            return Err(anyhow::anyhow!("Minimum chunk duration must be positive"));
        }

        if self.processing.chunk_seconds < self.processing.min_chunk_seconds {
            return Err(anyhow::anyhow!(
                "Chunk ({}s) is shorter than the minimum ({}s)",
                self.processing.chunk_seconds,
                self.processing.min_chunk_seconds
            ));
        }

        if self.processing.load_timeout_secs == 0 || self.processing.separation_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.storage.max_upload_mb * 1024 * 1024
    }
}

impl ProcessingConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn separation_timeout(&self) -> Duration {
        Duration::from_secs(self.separation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.model.default_sample_rate, 24_000);
        assert_eq!(config.processing.chunk_seconds, 10.0);
        assert_eq!(config.processing.overlap_seconds, 3.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.model_id = "   ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.max_upload_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_shorter_than_chunk() {
        let mut config = AppConfig::default();
        config.processing.overlap_seconds = config.processing.chunk_seconds;
        assert!(config.validate().is_err());

        config.processing.overlap_seconds = -1.0;
        assert!(config.validate().is_err());

        config.processing.overlap_seconds = 2.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_chunk_must_meet_minimum() {
        let mut config = AppConfig::default();
        config.processing.chunk_seconds = 0.5;
        config.processing.overlap_seconds = 0.1;
        assert!(config.validate().is_err());

        config.processing.min_chunk_seconds = 0.25;
        assert!(config.validate().is_ok());

        config.processing.min_chunk_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_limit_in_bytes() {
        let config = AppConfig::default();
        assert_eq!(config.max_upload_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.processing.load_timeout(), Duration::from_secs(1800));
    }
}
