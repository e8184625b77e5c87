//! # Application State Management
//!
//! State shared by every HTTP handler and every channel session.
//!
//! ## Contents:
//! - **config**: the resolved configuration, immutable after startup
//! - **service**: the process-wide conversion service (model loaded once)
//! - **metrics**: counters updated by sessions, read by `/health`
//! - **polling**: long-polling sessions, shared by every worker
//!
//! Everything is behind an `Arc`, so cloning `AppState` into a worker or a
//! session only bumps reference counts.

use crate::channel::polling::PollingSessions;
use crate::config::AppConfig;
use crate::conversion::ConversionService;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<ConversionService>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub polling: PollingSessions,
    pub start_time: Instant,
}

/// Counters collected across all channel sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Channel sessions opened since start, either transport
    pub connections_total: u64,

    /// Channel sessions currently open
    pub active_sessions: u32,

    pub conversions_ok: u64,
    pub conversions_failed: u64,

    /// Wall-clock time spent in successful conversions
    pub total_inference_ms: u64,

    /// Failed conversions keyed by `AppError::kind()`
    pub errors_by_kind: HashMap<String, u64>,
}

impl AppState {
    pub fn new(config: AppConfig, service: Arc<ConversionService>) -> Self {
        Self {
            config: Arc::new(config),
            service,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            polling: PollingSessions::default(),
            start_time: Instant::now(),
        }
    }

    // A panicking writer only leaves counters behind, so poisoning is ignored.
    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called when a channel session starts.
    pub fn increment_active_sessions(&self) {
        let mut metrics = self.write_metrics();
        metrics.connections_total += 1;
        metrics.active_sessions += 1;
    }

    /// Called when a channel session stops. Never goes below zero.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_conversion(&self, elapsed_ms: u64) {
        let mut metrics = self.write_metrics();
        metrics.conversions_ok += 1;
        metrics.total_inference_ms += elapsed_ms;
    }

    pub fn record_conversion_error(&self, kind: &str) {
        let mut metrics = self.write_metrics();
        metrics.conversions_failed += 1;
        *metrics.errors_by_kind.entry(kind.to_string()).or_default() += 1;
    }

    /// Copy of the counters, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn average_inference_ms(&self) -> f64 {
        if self.conversions_ok > 0 {
            self.total_inference_ms as f64 / self.conversions_ok as f64
        } else {
            0.0
        }
    }

    /// Failed share of all conversions, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        let total = self.conversions_ok + self.conversions_failed;
        if total > 0 {
            self.conversions_failed as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversion::service::tests::{service_with, ConstantModel};

    pub(crate) fn test_state() -> AppState {
        let service = service_with(Arc::new(ConstantModel::new(0.25)));
        AppState::new(AppConfig::default(), Arc::new(service))
    }

    #[test]
    fn test_session_counters() {
        let state = test_state();
        state.increment_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();
        state.decrement_active_sessions();
        state.decrement_active_sessions();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.connections_total, 2);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[test]
    fn test_conversion_counters() {
        let state = test_state();
        state.record_conversion(30);
        state.record_conversion(10);
        state.record_conversion_error("validation_error");
        state.record_conversion_error("validation_error");

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.conversions_ok, 2);
        assert_eq!(metrics.average_inference_ms(), 20.0);
        assert_eq!(metrics.errors_by_kind["validation_error"], 2);
        assert_eq!(metrics.error_rate(), 0.5);
    }

    #[test]
    fn test_clones_share_metrics() {
        let state = test_state();
        let clone = state.clone();
        clone.record_conversion(5);
        assert_eq!(state.get_metrics_snapshot().conversions_ok, 1);
    }
}
