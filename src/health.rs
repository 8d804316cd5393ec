//! Service health and metrics endpoints.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

/// `GET /health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let orchestrator = &state.orchestrator;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_separations": metrics.active_separations,
            "completed_separations": metrics.completed_separations
        },
        "memory": get_memory_info(),
        "model": {
            "model_id": orchestrator.model_id(),
            "state": orchestrator.state().as_str(),
            "sample_rate": orchestrator.sample_rate(),
            "device": orchestrator.device()
        },
        "system": get_system_status(&state)
    }))
}

/// `GET /metrics`
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_separations": metrics.active_separations,
            "completed_separations": metrics.completed_separations,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "processing": {
            "queued_requests": state.orchestrator.queued(),
            "max_queued_requests": state.config.processing.max_queued_requests,
            "min_chunk_seconds": state.config.processing.min_chunk_seconds,
            "max_upload_mb": state.config.storage.max_upload_mb
        }
    }))
}

/// Resident and virtual memory of this process, from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |key: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(key))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "peak_resident_memory_bytes": read_kb("VmHWM:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Load summary: a full separation queue is what callers notice first.
fn get_system_status(state: &AppState) -> serde_json::Value {
    let queued = state.orchestrator.queued();
    let max_queued = state.config.processing.max_queued_requests;

    let queue_usage = if max_queued > 0 {
        queued as f64 / max_queued as f64
    } else if queued > 0 {
        1.0
    } else {
        0.0
    };

    let status = if queue_usage >= 1.0 {
        "saturated"
    } else if queue_usage > 0.5 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "queue_usage_percent": (queue_usage * 100.0).round(),
        "queued_requests": queued,
        "max_queued_requests": max_queued,
        "load_warnings": if queue_usage >= 1.0 {
            vec!["Separation queue is full - new requests are rejected as busy"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separation::testing::FakeLoader;
    use crate::state::testing::fake_state;
    use actix_web::{test, App};
    use tempfile::tempdir;

    #[actix_web::test]
    async fn test_health_reports_model_state() {
        let dir = tempdir().unwrap();
        let state = web::Data::new(fake_state(dir.path(), FakeLoader::new()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"]["state"], "unloaded");
        assert_eq!(body["model"]["model_id"], "test/fake-separator");
        assert_eq!(body["system"]["status"], "normal");

        state.orchestrator.ensure_loaded().await.unwrap();
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["model"]["state"], "loaded");
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let dir = tempdir().unwrap();
        let state = web::Data::new(fake_state(dir.path(), FakeLoader::new()));
        state.record_endpoint_request("GET /status", 4, false);

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /status");
        assert_eq!(body["processing"]["queued_requests"], 0);
    }
}
