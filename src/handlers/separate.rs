//! # Separation Upload Handler
//!
//! `POST /separate` accepts a multipart form:
//! - **audio**: the file to separate (mp3, wav, flac, m4a, ogg, aac)
//! - **description**: what to isolate ("piano", "crowd noise")
//! - **use_long_audio** / **useLongAudio**: `"true"` selects chunked processing
//! - **chunk_seconds**, **overlap_seconds**: optional chunking overrides
//!
//! The upload is streamed to `storage.upload_dir` under a unique name and is
//! removed again when the request finishes, whatever the outcome.

use super::audio::sanitize_filename;
use crate::error::{AppError, AppResult};
use crate::separation::{IsolationMetadata, IsolationRequest, SeparationMode};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["mp3", "wav", "flac", "m4a", "ogg", "aac"];

/// Upper bound for plain text form fields
const MAX_TEXT_FIELD_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
pub struct SeparateResponse {
    pub success: bool,
    pub target_url: String,
    pub residual_url: String,
    pub metadata: IsolationMetadata,
}

/// Removes the staged upload when dropped.
pub struct UploadGuard {
    path: PathBuf,
}

impl UploadGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed upload {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove upload {:?}: {}", self.path, e),
        }
    }
}

/// What became of the `audio` field.
enum AudioField {
    /// Part present but no filename
    Unnamed,
    /// Extension outside [`ALLOWED_EXTENSIONS`]
    Disallowed,
    Stored(UploadGuard),
}

#[derive(Default)]
struct SeparateForm {
    audio: Option<AudioField>,
    description: Option<String>,
    use_long_audio: bool,
    chunk_seconds: Option<String>,
    overlap_seconds: Option<String>,
}

fn allowed_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// `{sanitized_stem}_{8 hex chars}.{ext}`
fn staged_name(original: &str, ext: &str) -> String {
    let safe = sanitize_filename(original);
    let stem = Path::new(&safe)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("audio")
        .to_string();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}.{}", stem, &unique[..8], ext)
}

async fn read_text(field: &mut Field) -> AppResult<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(AppError::BadRequest("Form field too large".to_string()));
        }
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8(bytes).map_err(|_| AppError::BadRequest("Form fields must be UTF-8 text".to_string()))
}

async fn drain(field: &mut Field) -> AppResult<()> {
    while let Some(chunk) = field.next().await {
        chunk?;
    }
    Ok(())
}

/// Stream the file part to disk, enforcing the upload limit.
async fn store_upload(field: &mut Field, upload_dir: &Path, filename: &str, ext: &str, max_bytes: u64) -> AppResult<UploadGuard> {
    let path = upload_dir.join(staged_name(filename, ext));
    let mut file = tokio::fs::File::create(&path).await?;
    let guard = UploadGuard::new(path);

    let mut written: u64 = 0;
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(AppError::BadRequest(format!(
                "File too large. Maximum size is {}MB",
                max_bytes / (1024 * 1024)
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    debug!("Stored upload {:?} ({} bytes)", guard.path(), written);
    Ok(guard)
}

async fn read_form(mut payload: Multipart, state: &AppState) -> AppResult<SeparateForm> {
    let mut form = SeparateForm::default();
    let upload_dir = &state.config.storage.upload_dir;
    let max_bytes = state.config.max_upload_bytes();

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let (name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(str::to_string),
            ),
            None => (String::new(), None),
        };

        match name.as_str() {
            "audio" if form.audio.is_none() => {
                let filename = filename.unwrap_or_default();
                form.audio = Some(if filename.is_empty() {
                    drain(&mut field).await?;
                    AudioField::Unnamed
                } else if let Some(ext) = allowed_extension(&filename) {
                    AudioField::Stored(store_upload(&mut field, upload_dir, &filename, &ext, max_bytes).await?)
                } else {
                    drain(&mut field).await?;
                    AudioField::Disallowed
                });
            }
            "description" => form.description = Some(read_text(&mut field).await?),
            "use_long_audio" | "useLongAudio" => {
                form.use_long_audio = read_text(&mut field).await?.trim().eq_ignore_ascii_case("true");
            }
            "chunk_seconds" => form.chunk_seconds = Some(read_text(&mut field).await?),
            "overlap_seconds" => form.overlap_seconds = Some(read_text(&mut field).await?),
            _ => drain(&mut field).await?,
        }
    }

    Ok(form)
}

fn parse_seconds(raw: Option<&str>, field: &str, default: f64) -> AppResult<f64> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(text) => text
            .parse::<f64>()
            .map_err(|_| AppError::ValidationError(format!("Invalid {}: {}", field, text))),
    }
}

/// `POST /separate`
pub async fn separate(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let form = read_form(payload, &state).await?;

    let upload = match form.audio {
        None => return Err(AppError::ValidationError("No audio file provided".to_string())),
        Some(AudioField::Unnamed) => return Err(AppError::ValidationError("No file selected".to_string())),
        Some(AudioField::Disallowed) => {
            return Err(AppError::ValidationError(format!(
                "Invalid file type. Allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            )))
        }
        Some(AudioField::Stored(guard)) => guard,
    };

    let description = form.description.as_deref().unwrap_or("").trim().to_string();
    if description.is_empty() {
        return Err(AppError::ValidationError("No description provided".to_string()));
    }

    let mode = if form.use_long_audio {
        let processing = &state.config.processing;
        SeparationMode::Chunked {
            chunk_seconds: parse_seconds(form.chunk_seconds.as_deref(), "chunk_seconds", processing.chunk_seconds)?,
            overlap_seconds: parse_seconds(form.overlap_seconds.as_deref(), "overlap_seconds", processing.overlap_seconds)?,
        }
    } else {
        SeparationMode::Whole
    };

    info!("Separation requested for {:?} ({})", upload.path(), mode.label());

    state.separation_started();
    let outcome = state
        .orchestrator
        .isolate(IsolationRequest {
            source_audio_path: upload.path().to_path_buf(),
            description,
            mode,
        })
        .await;
    state.separation_finished(outcome.is_ok());
    drop(upload);

    if let Err(e) = &outcome {
        warn!(stage = e.stage.as_str(), "Separation failed: {}", e);
    }

    let result = outcome?;
    let url_for = |path: &Path| {
        format!(
            "/audio/{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        )
    };

    Ok(HttpResponse::Ok().json(SeparateResponse {
        success: true,
        target_url: url_for(&result.target_path),
        residual_url: url_for(&result.residual_path),
        metadata: result.metadata,
    }))
}
