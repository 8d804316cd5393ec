//! Model status and explicit loading.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub model_loaded: bool,
    /// "unloaded", "loading" or "loaded"
    pub model_state: &'static str,
    pub model_id: String,
    pub sample_rate: u32,
    pub device: String,
}

#[derive(Debug, Serialize)]
pub struct LoadModelResponse {
    pub success: bool,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /status`
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let orchestrator = &state.orchestrator;
    let model_state = orchestrator.state();

    HttpResponse::Ok().json(StatusResponse {
        model_loaded: orchestrator.is_loaded(),
        model_state: model_state.as_str(),
        model_id: orchestrator.model_id().to_string(),
        sample_rate: orchestrator.sample_rate(),
        device: orchestrator.device(),
    })
}

/// `POST /load-model`
///
/// Downloads the model on first use, so this may take minutes. Concurrent
/// calls share one load. Failures are reported in the body, not the status.
pub async fn load_model(state: web::Data<AppState>) -> HttpResponse {
    let error = match state.orchestrator.ensure_loaded().await {
        Ok(_) => None,
        Err(e) => {
            warn!("Explicit model load failed: {}", e);
            Some(e.to_string())
        }
    };

    HttpResponse::Ok().json(LoadModelResponse {
        success: error.is_none(),
        model_loaded: state.orchestrator.is_loaded(),
        error,
    })
}
