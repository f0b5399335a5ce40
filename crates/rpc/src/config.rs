//! Configuration for the RPC layer
//!
//! This module provides configuration structures for endpoints, the
//! connection pool, health tracking, the background monitor and retries.
//! All durations are stored in milliseconds.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RpcError, RpcResult};

/// Sepolia chain ID
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

/// Lowest accepted request budget, one request every 1000 seconds
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// Endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique name of the endpoint
    pub name: String,

    /// URL of the endpoint
    pub url: String,

    /// Selection priority (lower = preferred)
    pub priority: u32,

    /// Request budget of the provider
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,
}

fn default_max_requests_per_second() -> f64 {
    5.0
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority,
            max_requests_per_second: default_max_requests_per_second(),
        }
    }

    /// Build an endpoint from a bare URL, naming it after the host
    pub fn from_url(url: impl Into<String>, priority: u32) -> Self {
        let url = url.into();
        let name = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| format!("endpoint-{}", priority));
        Self::new(name, url, priority)
    }

    pub fn with_rate_limit(mut self, max_requests_per_second: f64) -> Self {
        self.max_requests_per_second = max_requests_per_second;
        self
    }

    /// Minimum spacing between two requests to this endpoint
    pub fn min_request_interval(&self) -> Duration {
        request_interval(self.max_requests_per_second)
    }
}

/// Spacing implied by a request budget. Non-positive budgets mean unpaced,
/// budgets too small to represent saturate at `Duration::MAX`.
pub(crate) fn request_interval(max_requests_per_second: f64) -> Duration {
    if !(max_requests_per_second > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(1.0 / max_requests_per_second).unwrap_or(Duration::MAX)
}

/// Health tracking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors before an endpoint is marked unhealthy
    pub unhealthy_threshold: u32,

    /// How long a rate-limited endpoint is skipped
    pub rate_limit_cooldown_ms: u64,

    /// Quiet period after which one consecutive error is forgiven
    pub error_decay_after_ms: u64,

    /// Weight of the newest sample in the latency moving average
    pub latency_smoothing: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            rate_limit_cooldown_ms: 60_000,
            error_decay_after_ms: 120_000,
            latency_smoothing: 0.2,
        }
    }
}

impl HealthConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn error_decay_after(&self) -> Duration {
        Duration::from_millis(self.error_decay_after_ms)
    }
}

/// Background monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether the background monitor runs at all
    pub enabled: bool,

    /// Interval between probe cycles
    pub interval_ms: u64,

    /// Deadline of a single probe
    pub probe_timeout_ms: u64,

    /// Pause between two consecutive probes
    pub probe_delay_ms: u64,

    /// Interval between aggregated health reports
    pub report_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            probe_delay_ms: 50,
            report_interval_ms: 300_000,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of connections per endpoint
    pub size_per_endpoint: usize,

    /// Connections with more errors than this are reset by a recovery pass
    pub recovery_error_threshold: u32,

    /// Pause after a recovery pass
    pub recovery_cooldown_ms: u64,

    /// Deadline of one pooled call
    pub call_timeout_ms: u64,

    /// Attempts made by `ConnectionPool::execute`
    pub max_retries: u32,

    /// Base of the exponential backoff between pooled attempts
    pub backoff_base_ms: u64,

    /// Upper bound of the exponential backoff
    pub backoff_max_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_per_endpoint: 3,
            recovery_error_threshold: 5,
            recovery_cooldown_ms: 5_000,
            call_timeout_ms: 10_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Retry configuration of the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default number of attempts
    pub max_retries: u32,

    /// Lower bound of the randomized delay before the first attempt
    pub pre_delay_min_ms: u64,

    /// Upper bound of the randomized delay before the first attempt
    pub pre_delay_max_ms: u64,

    /// Deadline of one attempt
    pub call_timeout_ms: u64,

    /// Backoff after a rate-limited attempt: base + step * attempt
    pub rate_limit_backoff_base_ms: u64,
    pub rate_limit_backoff_step_ms: u64,

    /// Backoff after any other retryable failure: base + step * attempt
    pub transient_backoff_base_ms: u64,
    pub transient_backoff_step_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            pre_delay_min_ms: 500,
            pre_delay_max_ms: 1_500,
            call_timeout_ms: 10_000,
            rate_limit_backoff_base_ms: 2_000,
            rate_limit_backoff_step_ms: 1_000,
            transient_backoff_base_ms: 0,
            transient_backoff_step_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Configuration of `execute_sequentially`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Attempts per item
    pub per_item_retries: u32,

    /// Extra delay added per item index
    pub delay_step_ms: u64,

    /// Cap of the inter-item delay
    pub max_delay_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            per_item_retries: 2,
            delay_step_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// RPC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Candidate endpoints
    pub endpoints: Vec<EndpointConfig>,

    /// Chain every endpoint must serve
    pub expected_chain_id: Option<u64>,

    /// Host fragments of providers whose failures always count as throttling
    pub denylisted_hosts: Vec<String>,

    pub health: HealthConfig,

    pub monitor: MonitorConfig,

    pub pool: PoolConfig,

    pub retry: RetryConfig,

    pub sequence: SequenceConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                EndpointConfig::new("publicnode", "https://ethereum-sepolia-rpc.publicnode.com", 1),
                EndpointConfig::new("sepolia-org", "https://rpc.sepolia.org", 2),
                EndpointConfig::new("1rpc", "https://1rpc.io/sepolia", 3),
                EndpointConfig::new("drpc", "https://sepolia.drpc.org", 4),
            ],
            expected_chain_id: Some(SEPOLIA_CHAIN_ID),
            denylisted_hosts: vec!["drpc.org".to_string()],
            health: HealthConfig::default(),
            monitor: MonitorConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Replace the endpoint list with bare URLs, priority following list order
    pub fn with_endpoint_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| EndpointConfig::from_url(url, i as u32 + 1))
            .collect();
        self
    }

    /// Whether the URL belongs to a denylisted provider
    pub fn is_denylisted(&self, url: &str) -> bool {
        self.denylisted_hosts
            .iter()
            .any(|host| !host.is_empty() && url.contains(host.as_str()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> RpcResult<()> {
        if self.endpoints.is_empty() {
            return Err(RpcError::InvalidConfig(
                "At least one RPC endpoint must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(RpcError::InvalidConfig(format!(
                    "Endpoint with URL {} has an empty name",
                    endpoint.url
                )));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(RpcError::InvalidConfig(format!(
                    "Duplicate endpoint name: {}",
                    endpoint.name
                )));
            }
            if !(endpoint.url.starts_with("http://") || endpoint.url.starts_with("https://")) {
                return Err(RpcError::InvalidConfig(format!(
                    "Endpoint {} must use an http(s) URL, got {:?}",
                    endpoint.name, endpoint.url
                )));
            }
            if !(endpoint.max_requests_per_second >= MIN_REQUESTS_PER_SECOND) {
                return Err(RpcError::InvalidConfig(format!(
                    "Endpoint {} must allow at least {} requests per second, got {}",
                    endpoint.name, MIN_REQUESTS_PER_SECOND, endpoint.max_requests_per_second
                )));
            }
        }

        if self.pool.size_per_endpoint == 0 {
            return Err(RpcError::InvalidConfig(
                "Connection pool size must be greater than 0".to_string(),
            ));
        }

        if self.retry.call_timeout_ms == 0 || self.pool.call_timeout_ms == 0 {
            return Err(RpcError::InvalidConfig(
                "Call timeout must be greater than 0".to_string(),
            ));
        }

        if self.monitor.probe_timeout_ms == 0 || self.monitor.interval_ms == 0 {
            return Err(RpcError::InvalidConfig(
                "Monitor interval and probe timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.pre_delay_min_ms > self.retry.pre_delay_max_ms {
            return Err(RpcError::InvalidConfig(
                "Pre-delay minimum must not exceed its maximum".to_string(),
            ));
        }

        if self.health.unhealthy_threshold == 0 {
            return Err(RpcError::InvalidConfig(
                "Unhealthy threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RpcConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.size_per_endpoint, 3);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.health.rate_limit_cooldown(), Duration::from_secs(60));
        assert_eq!(config.retry.call_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_urls_keep_order() {
        let config = RpcConfig::default().with_endpoint_urls([
            "https://eth-sepolia.g.alchemy.com/v2/key",
            "https://sepolia.infura.io/v3/key",
        ]);

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].name, "eth-sepolia.g.alchemy.com");
        assert_eq!(config.endpoints[0].priority, 1);
        assert_eq!(config.endpoints[1].name, "sepolia.infura.io");
        assert_eq!(config.endpoints[1].priority, 2);
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let mut config = RpcConfig::default();
        config.endpoints = vec![
            EndpointConfig::new("a", "https://a.example", 1),
            EndpointConfig::new("a", "https://b.example", 2),
        ];
        assert!(matches!(config.validate(), Err(RpcError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let mut config = RpcConfig::default();
        config.endpoints = vec![EndpointConfig::new("a", "wss://a.example", 1)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_denylist() {
        let config = RpcConfig::default();
        assert!(config.is_denylisted("https://sepolia.drpc.org"));
        assert!(!config.is_denylisted("https://rpc.sepolia.org"));
    }

    #[test]
    fn test_min_request_interval() {
        let endpoint = EndpointConfig::new("a", "https://a.example", 1).with_rate_limit(4.0);
        assert_eq!(endpoint.min_request_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_min_request_interval_saturates() {
        let endpoint = EndpointConfig::new("a", "https://a.example", 1).with_rate_limit(1e-20);
        assert_eq!(endpoint.min_request_interval(), Duration::MAX);

        assert_eq!(request_interval(0.0), Duration::ZERO);
        assert_eq!(request_interval(f64::NAN), Duration::ZERO);
        assert_eq!(request_interval(f64::INFINITY), Duration::ZERO);
    }

    #[test]
    fn test_validation_rejects_tiny_rates() {
        for rate in [0.0, -1.0, 1e-20, f64::NAN] {
            let mut config = RpcConfig::default();
            config.endpoints = vec![EndpointConfig::new("a", "https://a.example", 1).with_rate_limit(rate)];
            assert!(
                matches!(config.validate(), Err(RpcError::InvalidConfig(_))),
                "rate {} accepted",
                rate
            );
        }

        let mut config = RpcConfig::default();
        config.endpoints = vec![
            EndpointConfig::new("a", "https://a.example", 1).with_rate_limit(MIN_REQUESTS_PER_SECOND),
        ];
        assert!(config.validate().is_ok());
    }
}
