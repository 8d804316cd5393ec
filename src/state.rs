//! # Application State
//!
//! Shared state handed to every request handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated startup configuration (read-only at runtime)
//! - **orchestrator**: the one separation orchestrator owned by the service
//! - **metrics**: request/error counters updated by middleware
//! - **start_time**: for uptime reporting
//!
//! ## Arc<RwLock<T>> Pattern
//! Metrics are written by every request and read by `/health` and `/metrics`,
//! so they sit behind a reader-writer lock. Everything else is immutable after
//! startup and only needs an `Arc`.

use crate::config::AppConfig;
use crate::separation::IsolationOrchestrator;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Owns model lifecycle and serializes separations
    pub orchestrator: Arc<IsolationOrchestrator>,

    /// Performance metrics (updated by every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed requests since server start
    pub error_count: u64,

    /// Separation requests currently being handled
    pub active_separations: u32,

    /// Completed separations since server start
    pub completed_separations: u64,

    /// Per-endpoint statistics, keyed like "POST /separate"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Arc<IsolationOrchestrator>) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut AppMetrics) -> R) -> R {
        // A panic while holding the lock leaves counters usable
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    /// Called by middleware for every request.
    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    /// Called for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record one request against `endpoint` (e.g. "GET /status").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    pub fn separation_started(&self) {
        self.with_metrics(|m| m.active_separations += 1);
    }

    /// Underflow-safe; `succeeded` also bumps the completed counter.
    pub fn separation_finished(&self, succeeded: bool) {
        self.with_metrics(|m| {
            m.active_separations = m.active_separations.saturating_sub(1);
            if succeeded {
                m.completed_separations += 1;
            }
        });
    }

    /// Consistent copy of the metrics, taken under the read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::separation::testing::FakeLoader;
    use crate::separation::{IsolationOrchestrator, OrchestratorSettings};
    use std::path::Path;

    /// State wired to the in-process fake backend, storing files under `root`.
    pub fn fake_state(root: &Path, loader: FakeLoader) -> AppState {
        let mut config = AppConfig::default();
        config.storage.upload_dir = root.join("uploads");
        config.storage.output_dir = root.join("output");
        std::fs::create_dir_all(&config.storage.upload_dir).unwrap();
        std::fs::create_dir_all(&config.storage.output_dir).unwrap();

        let orchestrator = IsolationOrchestrator::new(Arc::new(loader), OrchestratorSettings::from_config(&config));
        AppState::new(config, Arc::new(orchestrator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separation::testing::FakeLoader;
    use tempfile::tempdir;

    #[test]
    fn test_endpoint_metrics() {
        let dir = tempdir().unwrap();
        let state = testing::fake_state(dir.path(), FakeLoader::new());

        state.record_endpoint_request("GET /status", 10, false);
        state.record_endpoint_request("GET /status", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /status"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_separation_counters_never_underflow() {
        let dir = tempdir().unwrap();
        let state = testing::fake_state(dir.path(), FakeLoader::new());

        state.separation_started();
        state.separation_finished(true);
        state.separation_finished(false);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_separations, 0);
        assert_eq!(snapshot.completed_separations, 1);
    }

    #[test]
    fn test_empty_endpoint_metric() {
        let metric = EndpointMetric::default();
        assert_eq!(metric.average_duration_ms(), 0.0);
        assert_eq!(metric.error_rate(), 0.0);
    }
}
