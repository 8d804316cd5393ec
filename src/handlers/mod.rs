pub mod audio;
pub mod separate;
pub mod status;

pub use audio::serve_audio;
pub use separate::separate;
pub use status::{load_model, status};

use actix_web::web;

/// Model and separation routes, mounted both at the root and under `/api`.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.route("/status", web::get().to(status))
        .route("/load-model", web::post().to(load_model))
        .route("/separate", web::post().to(separate));
}
