//! # Error Handling
//!
//! HTTP-facing error type and its conversion into JSON responses.
//!
//! Every error body carries the same flat shape so clients can always read
//! `error` as a plain message:
//!
//! ```json
//! {
//!   "error": "No description provided",
//!   "type": "validation_error",
//!   "timestamp": "2025-01-01T12:00:00Z"
//! }
//! ```

use crate::separation::{IsolationError, Stage};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the client sent something we cannot read (400)
/// - **NotFound**: requested resource doesn't exist (404)
/// - **ValidationError**: input failed validation rules (400)
/// - **ModelLoad**: the separation model could not be loaded (500)
/// - **Processing**: separation or persisting failed (500)
/// - **Busy**: too many requests are already queued behind a separation (503)
/// - **Timeout**: the model did not answer in time (504)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ValidationError(String),
    ModelLoad(String),
    Processing(String),
    Busy(String),
    Timeout(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::ModelLoad(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "model_load_error", msg),
            AppError::Processing(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "processing_error", msg),
            AppError::Busy(msg) => (StatusCode::SERVICE_UNAVAILABLE, "busy", msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", msg),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The message alone; the type tag travels separately in the JSON body.
        let (_, _, message) = self.parts();
        write!(f, "{}", message)
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": message,
            "type": error_type,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Malformed multipart body: {}", err))
    }
}

/// Orchestrator failures keep their stage when they cross into HTTP.
///
/// Corrupt or unreadable audio is the uploader's problem, so `Prepare`
/// maps to 400 rather than 500.
impl From<IsolationError> for AppError {
    fn from(err: IsolationError) -> Self {
        let message = err.to_string();
        match err.stage {
            Stage::Validation | Stage::Prepare => AppError::ValidationError(message),
            Stage::ModelLoad => AppError::ModelLoad(message),
            Stage::Processing | Stage::Persist => AppError::Processing(message),
            Stage::Busy => AppError::Busy(message),
            Stage::Timeout => AppError::Timeout(message),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_is_flat() {
        let err = AppError::ValidationError("No description provided".to_string());
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "No description provided");
        assert_eq!(value["type"], "validation_error");
    }

    #[test]
    fn test_isolation_stage_mapping() {
        let cases = [
            (Stage::Validation, StatusCode::BAD_REQUEST),
            (Stage::Prepare, StatusCode::BAD_REQUEST),
            (Stage::ModelLoad, StatusCode::INTERNAL_SERVER_ERROR),
            (Stage::Processing, StatusCode::INTERNAL_SERVER_ERROR),
            (Stage::Persist, StatusCode::INTERNAL_SERVER_ERROR),
            (Stage::Busy, StatusCode::SERVICE_UNAVAILABLE),
            (Stage::Timeout, StatusCode::GATEWAY_TIMEOUT),
        ];

        for (stage, status) in cases {
            let err: AppError = IsolationError::new(stage, "boom").into();
            assert_eq!(err.status_code(), status, "stage {:?}", stage);
        }
    }
}
