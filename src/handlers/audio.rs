//! Serving separated stems, plus the filename sanitizer shared with uploads.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use futures_util::stream::{self, Stream};
use tokio::io::AsyncReadExt;
use tracing::debug;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Reduce a client-supplied filename to a safe, portable single path component.
///
/// Path separators become underscores, anything outside `[A-Za-z0-9._-]` is
/// dropped, and leading/trailing dots and underscores are stripped. The result
/// may be empty.
pub fn sanitize_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn not_found() -> AppError {
    AppError::NotFound("File not found".to_string())
}

/// `GET /audio/{filename}`
///
/// Only names that survive sanitization unchanged are served, and only from
/// the output directory.
pub async fn serve_audio(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let requested = path.into_inner();
    let safe = sanitize_filename(&requested);
    if safe.is_empty() || safe != requested {
        debug!("Refusing audio request for {:?}", requested);
        return Err(not_found());
    }

    let output_dir = &state.config.storage.output_dir;
    let candidate = output_dir.join(&safe);

    let (root, resolved) = match (
        tokio::fs::canonicalize(output_dir).await,
        tokio::fs::canonicalize(&candidate).await,
    ) {
        (Ok(root), Ok(resolved)) => (root, resolved),
        _ => return Err(not_found()),
    };

    if !resolved.starts_with(&root) {
        return Err(not_found());
    }
    let len = match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(not_found()),
    };

    let file = tokio::fs::File::open(&resolved).await?;
    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .no_chunking(len)
        .streaming(file_chunks(file)))
}

/// Reads `file` in fixed-size chunks so large stems never sit in memory whole.
fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = Result<web::Bytes, std::io::Error>> {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(read);
        Ok(Some((web::Bytes::from(buf), file)))
    })
}
