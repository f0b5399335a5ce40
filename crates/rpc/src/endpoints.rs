//! Endpoint registry and health tracking
//!
//! This module owns the canonical list of RPC endpoints and their live
//! health state: the healthy flag, consecutive errors, recency and the
//! rate-limit timestamp. It never fails on bad state; it only records it.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{request_interval, EndpointConfig, HealthConfig};
use crate::error::{FailureClass, RpcError, RpcResult};

/// RPC endpoint with its health state
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Unique name of the endpoint
    pub name: String,

    /// URL of the endpoint
    pub url: String,

    /// Selection priority (lower = preferred)
    pub priority: u32,

    /// Request budget of the provider
    pub max_requests_per_second: f64,

    /// Disabled endpoints are never selected (e.g. wrong chain)
    pub enabled: bool,

    /// Whether the endpoint is healthy
    pub healthy: bool,

    /// Consecutive errors
    pub consecutive_errors: u32,

    pub last_used_at: Option<Instant>,

    pub last_rate_limited_at: Option<Instant>,

    pub last_failure_at: Option<Instant>,

    /// Last error message
    pub last_error: Option<String>,
}

impl Endpoint {
    fn from_config(config: &EndpointConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            priority: config.priority,
            max_requests_per_second: config.max_requests_per_second,
            enabled: true,
            healthy: true,
            consecutive_errors: 0,
            last_used_at: None,
            last_rate_limited_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }

    pub fn to_config(&self) -> EndpointConfig {
        EndpointConfig::new(self.name.clone(), self.url.clone(), self.priority)
            .with_rate_limit(self.max_requests_per_second)
    }

    /// Minimum spacing between two requests
    pub fn min_request_interval(&self) -> Duration {
        request_interval(self.max_requests_per_second)
    }

    /// Whether the endpoint is inside its rate-limit cooldown
    pub fn is_rate_limited(&self, cooldown: Duration) -> bool {
        self.last_rate_limited_at
            .map(|at| at.elapsed() < cooldown)
            .unwrap_or(false)
    }
}

/// Status of an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,

    pub url: String,

    pub priority: u32,

    /// Whether the endpoint is enabled
    pub enabled: bool,

    /// Whether the endpoint is healthy
    pub healthy: bool,

    /// Consecutive errors
    pub error_count: u32,

    /// Whether the endpoint is inside its rate-limit cooldown
    pub rate_limited: bool,

    /// Milliseconds since the endpoint was last used
    pub last_used_ms_ago: Option<u64>,

    /// Last error message
    pub last_error: Option<String>,

    /// Last checked timestamp
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

/// Endpoint registry
pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Endpoint>>,
    config: HealthConfig,
}

impl EndpointRegistry {
    /// Create a registry from endpoint configurations
    pub fn new(endpoints: &[EndpointConfig], config: HealthConfig) -> RpcResult<Self> {
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints);
        }

        let mut entries: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if entries.iter().any(|e| e.name == endpoint.name) {
                return Err(RpcError::InvalidConfig(format!(
                    "Duplicate endpoint name: {}",
                    endpoint.name
                )));
            }
            entries.push(Endpoint::from_config(endpoint));
        }

        Ok(Self {
            endpoints: RwLock::new(entries),
            config,
        })
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.config
    }

    /// Healthy endpoints ordered by priority, then least recently used.
    ///
    /// When nothing is healthy every enabled endpoint is reset and the full
    /// enabled list is returned instead.
    pub fn list_healthy(&self) -> Vec<Endpoint> {
        let mut healthy: Vec<Endpoint> = self
            .endpoints
            .read()
            .iter()
            .filter(|e| e.enabled && e.healthy)
            .cloned()
            .collect();

        if healthy.is_empty() {
            let mut endpoints = self.endpoints.write();
            warn!("No healthy endpoints left, resetting all endpoints to healthy");
            for endpoint in endpoints.iter_mut().filter(|e| e.enabled) {
                endpoint.healthy = true;
                endpoint.consecutive_errors = 0;
            }
            healthy = endpoints.iter().filter(|e| e.enabled).cloned().collect();
        }

        healthy.sort_by_key(|e| (e.priority, e.last_used_at));
        healthy
    }

    /// Record a successful call or probe
    pub fn record_success(&self, name: &str) {
        let mut endpoints = self.endpoints.write();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.name == name) else {
            return;
        };

        // Never pull back a slot that reserve_slot stamped in the future
        let now = Instant::now();
        endpoint.last_used_at = Some(endpoint.last_used_at.map_or(now, |last| last.max(now)));
        endpoint.consecutive_errors = endpoint.consecutive_errors.saturating_sub(1);

        if !endpoint.healthy && endpoint.consecutive_errors == 0 {
            endpoint.healthy = true;
            info!(endpoint = %name, "Endpoint recovered");
        }
    }

    /// Record a failed call or probe
    pub fn record_failure(&self, name: &str, class: FailureClass, error: &RpcError) {
        let mut endpoints = self.endpoints.write();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.name == name) else {
            return;
        };

        let now = Instant::now();
        endpoint.consecutive_errors += 1;
        endpoint.last_failure_at = Some(now);
        endpoint.last_error = Some(error.to_string());

        if class == FailureClass::RateLimited {
            endpoint.last_rate_limited_at = Some(now);
        }

        if endpoint.healthy && endpoint.consecutive_errors >= self.config.unhealthy_threshold {
            endpoint.healthy = false;
            warn!(
                endpoint = %name,
                errors = endpoint.consecutive_errors,
                "Endpoint marked unhealthy"
            );
        } else {
            debug!(
                endpoint = %name,
                errors = endpoint.consecutive_errors,
                class = %class,
                "Recorded endpoint failure"
            );
        }
    }

    /// Whether the endpoint was rate limited less than `cooldown` ago
    pub fn is_rate_limited(&self, name: &str, cooldown: Duration) -> bool {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.is_rate_limited(cooldown))
            .unwrap_or(false)
    }

    /// Reserve the next request slot of an endpoint.
    ///
    /// Returns how long the caller must wait to respect the endpoint's
    /// minimum request interval. The slot is stamped immediately so
    /// concurrent callers queue up behind each other.
    pub fn reserve_slot(&self, name: &str) -> Duration {
        let mut endpoints = self.endpoints.write();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.name == name) else {
            return Duration::ZERO;
        };

        let now = Instant::now();
        let wait = match endpoint.last_used_at {
            Some(last) => last
                .checked_add(endpoint.min_request_interval())
                .map_or(Duration::MAX, |next| next.saturating_duration_since(now)),
            None => Duration::ZERO,
        };
        endpoint.last_used_at = Some(now + wait);
        wait
    }

    /// Forgive one error on endpoints that have been quiet long enough.
    ///
    /// Returns the names of endpoints that became healthy again.
    pub fn decay_errors(&self) -> Vec<String> {
        let decay_after = self.config.error_decay_after();
        let mut recovered = Vec::new();

        let mut endpoints = self.endpoints.write();
        for endpoint in endpoints.iter_mut() {
            if endpoint.consecutive_errors == 0 {
                continue;
            }
            let quiet = endpoint
                .last_failure_at
                .map(|at| at.elapsed() >= decay_after)
                .unwrap_or(true);
            if !quiet {
                continue;
            }

            endpoint.consecutive_errors -= 1;
            if endpoint.consecutive_errors == 0 && !endpoint.healthy {
                endpoint.healthy = true;
                info!(endpoint = %endpoint.name, "Endpoint recovered after error decay");
                recovered.push(endpoint.name.clone());
            }
        }

        recovered
    }

    /// Enable or disable an endpoint. Returns false for unknown names.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut endpoints = self.endpoints.write();
        match endpoints.iter_mut().find(|e| e.name == name) {
            Some(endpoint) => {
                endpoint.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Get an endpoint by name
    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.read().iter().find(|e| e.name == name).cloned()
    }

    /// All endpoints in configuration order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// Status of every endpoint
    pub fn status(&self) -> Vec<EndpointStatus> {
        let cooldown = self.config.rate_limit_cooldown();
        let now = chrono::Utc::now();

        self.endpoints
            .read()
            .iter()
            .map(|e| EndpointStatus {
                name: e.name.clone(),
                url: e.url.clone(),
                priority: e.priority,
                enabled: e.enabled,
                healthy: e.healthy,
                error_count: e.consecutive_errors,
                rate_limited: e.is_rate_limited(cooldown),
                last_used_ms_ago: e.last_used_at.map(|at| at.elapsed().as_millis() as u64),
                last_error: e.last_error.clone(),
                last_checked: now,
            })
            .collect()
    }
}
