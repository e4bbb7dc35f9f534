//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket actor: configuration,
//! request metrics, and the registry of live calls.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//! - Poisoned locks are recovered with `PoisonError::into_inner`: a panicked
//!   request must not take the metrics or the config down with it
//!
//! ### Config snapshots
//! Each call copies the configuration when it starts. Updating the config through
//! the API affects new calls only.

use crate::call::registry::{CallRegistry, RegistrySummary};
use crate::call::session::CallSession;
use crate::call::{CallOptions, CallServices, CallSummary};
use crate::config::AppConfig;
use crate::error::VoiceResult;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// Cloning is cheap: every field is either `Arc`-wrapped or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every live call, by call id
    pub calls: Arc<CallRegistry>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
///
/// Call counts live in the registry; see `AppState::call_summary`.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Detailed metrics for each API endpoint
    /// Key: endpoint name (e.g., "GET /api/v1/calls/{call_id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create the state with the services new calls will use.
    ///
    /// ## What this does:
    /// 1. Wraps the config in Arc<RwLock<>> for thread-safe sharing and updating
    /// 2. Creates the call registry with the configured limits
    /// 3. Records the current time as the server start time
    pub fn new(config: AppConfig, services: CallServices) -> Self {
        let calls = CallRegistry::new(
            services,
            config.performance.max_concurrent_calls,
            config.performance.call_archive_size,
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            calls: Arc::new(calls),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> anyhow::Result<()> {
        new_config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Start a call with the current configuration.
    pub fn start_call(&self, call_id: Option<String>, options: CallOptions) -> VoiceResult<Arc<CallSession>> {
        let config = self.get_config();
        self.calls.create(call_id, options, &config)
    }

    pub fn get_call(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.calls.get(call_id)
    }

    pub async fn end_call(&self, call_id: &str, reason: &str) -> VoiceResult<CallSummary> {
        self.calls.end(call_id, reason).await
    }

    /// End calls idle for longer than the configured timeout.
    pub async fn sweep_idle_calls(&self) -> usize {
        let max_idle = self.get_config().performance.idle_call_timeout();
        self.calls.cleanup_idle(max_idle).await
    }

    pub fn call_summary(&self) -> RegistrySummary {
        self.calls.summary()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "POST /api/v1/calls/events")
    /// - **duration_ms**: How long the request took to process (in milliseconds)
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        // Get or create metrics for this specific endpoint
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so we don't hold the lock while sending the HTTP response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0  // No requests yet, so no average to calculate
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
