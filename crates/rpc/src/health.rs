//! Rolling per-endpoint health samples

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

/// Rolling aggregate for one endpoint
#[derive(Debug, Clone, Default)]
pub struct HealthSample {
    pub total_checks: u64,
    pub failed_checks: u64,
    /// Exponential moving average over successful checks
    pub average_latency_ms: f64,
    pub last_successful_check_at: Option<Instant>,
}

impl HealthSample {
    /// Share of successful checks; 1.0 before the first check
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 1.0;
        }
        (self.total_checks - self.failed_checks) as f64 / self.total_checks as f64
    }
}

/// Health report line for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealthReport {
    pub endpoint: String,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub seconds_since_last_success: Option<u64>,
}

/// Health samples of all endpoints
pub struct HealthMetrics {
    samples: DashMap<String, HealthSample>,
    smoothing: f64,
}

impl HealthMetrics {
    pub fn new(smoothing: f64) -> Self {
        Self {
            samples: DashMap::new(),
            smoothing: smoothing.clamp(0.0, 1.0),
        }
    }

    pub fn record_success(&self, endpoint: &str, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut sample = self.samples.entry(endpoint.to_string()).or_default();

        let successes_before = sample.total_checks - sample.failed_checks;
        sample.average_latency_ms = if successes_before == 0 {
            latency_ms
        } else {
            self.smoothing * latency_ms + (1.0 - self.smoothing) * sample.average_latency_ms
        };
        sample.total_checks += 1;
        sample.last_successful_check_at = Some(Instant::now());
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut sample = self.samples.entry(endpoint.to_string()).or_default();
        sample.total_checks += 1;
        sample.failed_checks += 1;
    }

    pub fn sample(&self, endpoint: &str) -> Option<HealthSample> {
        self.samples.get(endpoint).map(|s| s.clone())
    }

    /// Report of every endpoint that has been sampled, sorted by name
    pub fn report(&self) -> Vec<EndpointHealthReport> {
        let mut report: Vec<EndpointHealthReport> = self
            .samples
            .iter()
            .map(|entry| {
                let sample = entry.value();
                EndpointHealthReport {
                    endpoint: entry.key().clone(),
                    total_checks: sample.total_checks,
                    failed_checks: sample.failed_checks,
                    success_rate: sample.success_rate(),
                    average_latency_ms: sample.average_latency_ms,
                    seconds_since_last_success: sample
                        .last_successful_check_at
                        .map(|at| at.elapsed().as_secs()),
                }
            })
            .collect();
        report.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        report
    }

    pub fn log_report(&self) {
        for line in self.report() {
            info!(
                endpoint = %line.endpoint,
                success_rate = %format!("{:.1}%", line.success_rate * 100.0),
                avg_latency_ms = %format!("{:.0}", line.average_latency_ms),
                since_last_success_s = ?line.seconds_since_last_success,
                checks = line.total_checks,
                "Endpoint health"
            );
        }
    }
}
