//! # Audio Isolation Service - Main Application Entry Point
//!
//! HTTP service that isolates a described sound ("piano", "dog barking") from
//! an uploaded audio file and serves the separated stems.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state handed to handlers: config, orchestrator, metrics
//! - **separation**: model lifecycle, separation dispatch, windowing, runner backend
//! - **audio**: decoding, resampling and WAV persistence
//! - **handlers**: `/status`, `/load-model`, `/separate`, `/audio/{filename}`
//! - **health**: `/health` and `/metrics`
//! - **middleware**: request logging and per-endpoint metrics
//! - **error**: HTTP error taxonomy and JSON error bodies

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod separation;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use separation::{HubLoader, IsolationOrchestrator, OrchestratorSettings};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM/SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Create the upload and output directories
/// 3. Build the orchestrator around the Hub runner backend
/// 4. Optionally preload the model in the background
/// 5. Serve until the server stops or a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        "Model {} via runner '{}', device preference '{}'",
        config.model.model_id, config.model.runner_program, config.model.device
    );

    for dir in [&config.storage.upload_dir, &config.storage.output_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("Cannot create directory {}", dir.display()))?;
    }

    let loader = HubLoader::new(config.model.clone());
    let orchestrator = Arc::new(IsolationOrchestrator::new(
        Arc::new(loader),
        OrchestratorSettings::from_config(&config),
    ));

    if config.model.preload {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.ensure_loaded().await {
                warn!("Model preload failed, will retry on first request: {}", e);
            }
        });
    }

    let app_state = AppState::new(config.clone(), orchestrator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(web::scope("/api").configure(handlers::configure_api))
            .configure(handlers::configure_api)
            .route("/audio/{filename}", web::get().to(handlers::serve_audio))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `audio_isolation_service=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_isolation_service=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
