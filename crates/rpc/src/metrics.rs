//! Metrics collection for the dispatcher
//!
//! This module collects request outcomes, failure classes and latencies of
//! dispatched calls and turns them into serializable snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::FailureClass;

const MAX_RECENT_LATENCIES: usize = 1000;

/// Snapshot of RPC metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMetricsSnapshot {
    /// Total dispatched calls
    pub total_requests: u64,

    /// Calls that eventually succeeded
    pub successful_requests: u64,

    /// Calls that failed after all attempts
    pub failed_requests: u64,

    /// Attempts rejected by provider throttling
    pub rate_limit_hits: u64,

    /// Attempts that hit the call timeout
    pub timeouts: u64,

    /// Calls stopped by a non-retryable error
    pub fatal_errors: u64,

    /// Extra attempts beyond the first
    pub retries: u64,

    /// Average latency of successful calls in milliseconds
    pub average_response_time_ms: f64,

    /// Endpoint currently preferred by the dispatcher
    pub active_provider: Option<String>,

    /// Failed attempts by class
    pub errors_by_class: HashMap<String, u64>,

    /// Latency percentiles in milliseconds (p50, p90, p95, p99)
    pub latency_percentiles: HashMap<String, u64>,

    /// Requests per second since start
    pub requests_per_second: f64,

    /// Timestamp of the snapshot
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// RPC metrics collector
pub struct RpcMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limit_hits: AtomicU64,
    timeouts: AtomicU64,
    fatal_errors: AtomicU64,
    retries: AtomicU64,

    /// Total latency of successful calls in microseconds
    total_latency_us: AtomicU64,

    errors_by_class: DashMap<String, u64>,

    active_provider: RwLock<Option<String>>,

    /// Recent latencies for percentile calculation, in microseconds
    recent_latencies: Mutex<Vec<u64>>,

    start_time: Instant,
}

impl RpcMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            errors_by_class: DashMap::new(),
            active_provider: RwLock::new(None),
            recent_latencies: Mutex::new(Vec::with_capacity(MAX_RECENT_LATENCIES)),
            start_time: Instant::now(),
        }
    }

    /// Record the start of a dispatched call
    pub fn record_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a call that succeeded after `latency`
    pub fn record_request_success(&self, latency: Duration) {
        self.successful_requests.fetch_add(1, Ordering::SeqCst);

        let latency_us = latency.as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::SeqCst);

        let mut recent_latencies = self.recent_latencies.lock();
        recent_latencies.push(latency_us);
        if recent_latencies.len() > MAX_RECENT_LATENCIES {
            recent_latencies.remove(0);
        }
    }

    /// Record a call that failed for good
    pub fn record_request_failure(&self, class: FailureClass) {
        self.failed_requests.fetch_add(1, Ordering::SeqCst);
        if class == FailureClass::Fatal {
            self.fatal_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Record one failed attempt
    pub fn record_attempt_failure(&self, class: FailureClass) {
        match class {
            FailureClass::RateLimited => {
                self.rate_limit_hits.fetch_add(1, Ordering::SeqCst);
            }
            FailureClass::Timeout => {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
            }
            FailureClass::Fatal | FailureClass::Transient => {}
        }
        *self.errors_by_class.entry(class.as_str().to_string()).or_insert(0) += 1;
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_active_provider(&self, name: &str) {
        let mut active = self.active_provider.write();
        if active.as_deref() != Some(name) {
            *active = Some(name.to_string());
        }
    }

    pub fn active_provider(&self) -> Option<String> {
        self.active_provider.read().clone()
    }

    /// Calculate latency percentiles in milliseconds
    fn calculate_latency_percentiles(&self) -> HashMap<String, u64> {
        let mut percentiles = HashMap::new();
        let mut sorted_latencies = self.recent_latencies.lock().clone();

        if sorted_latencies.is_empty() {
            return percentiles;
        }

        sorted_latencies.sort_unstable();
        let len = sorted_latencies.len();

        for (name, pct) in [("p50", 50), ("p90", 90), ("p95", 95), ("p99", 99)] {
            let index = (len * pct / 100).min(len - 1);
            percentiles.insert(name.to_string(), sorted_latencies[index] / 1000);
        }

        percentiles
    }

    /// Get a snapshot of the current metrics
    pub fn snapshot(&self) -> RpcMetricsSnapshot {
        let total = self.total_requests.load(Ordering::SeqCst);
        let successful = self.successful_requests.load(Ordering::SeqCst);
        let total_latency = self.total_latency_us.load(Ordering::SeqCst);

        let average_response_time_ms = if successful > 0 {
            total_latency as f64 / successful as f64 / 1000.0
        } else {
            0.0
        };

        let errors_by_class = self
            .errors_by_class
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let elapsed = self.start_time.elapsed().as_secs_f64();
        let requests_per_second = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };

        RpcMetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::SeqCst),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            fatal_errors: self.fatal_errors.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            average_response_time_ms,
            active_provider: self.active_provider(),
            errors_by_class,
            latency_percentiles: self.calculate_latency_percentiles(),
            requests_per_second,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Default for RpcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RpcMetrics::new();

        metrics.record_request_start();
        metrics.record_attempt_failure(FailureClass::RateLimited);
        metrics.record_retry();
        metrics.record_request_success(Duration::from_millis(40));

        metrics.record_request_start();
        metrics.record_attempt_failure(FailureClass::Fatal);
        metrics.record_request_failure(FailureClass::Fatal);

        metrics.set_active_provider("ep2");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.rate_limit_hits, 1);
        assert_eq!(snapshot.fatal_errors, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.errors_by_class["rate_limited"], 1);
        assert_eq!(snapshot.errors_by_class["fatal"], 1);
        assert_eq!(snapshot.active_provider.as_deref(), Some("ep2"));
        assert!((snapshot.average_response_time_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = RpcMetrics::new();
        for ms in 1..=100 {
            metrics.record_request_success(Duration::from_millis(ms));
        }

        let percentiles = metrics.snapshot().latency_percentiles;
        assert_eq!(percentiles["p50"], 51);
        assert_eq!(percentiles["p99"], 100);
    }
}
