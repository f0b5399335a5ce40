//! RPC dispatcher
//!
//! [`RpcDispatcher`] is the single entry point through which callers run
//! blockchain operations. An operation is any closure taking a
//! [`Connection`] and returning a future of `RpcResult<T>`; the dispatcher
//! selects the endpoint, paces and times out the call, classifies failures,
//! rotates endpoints and retries within a bounded budget.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::RpcConfig;
use crate::endpoints::{Endpoint, EndpointRegistry, EndpointStatus};
use crate::error::{FailureClass, RpcError, RpcResult};
use crate::health::{EndpointHealthReport, HealthMetrics};
use crate::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::monitor::HealthMonitor;
use crate::pool::{ConnectionLease, ConnectionPool, PoolStatus};
use crate::retry::{run_with_retries, Backoff, RetryDecision, RetryFailure};
use crate::transport::{Connection, ConnectionFactory, HttpConnector};

/// What `execute_sequentially` does when one item exhausts its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencePolicy {
    /// Log the failure and continue with the next item (bulk scans)
    BestEffort,

    /// Stop and return the failure (pipelines)
    Strict,
}

/// Outcome of checking one endpoint's chain ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainCheckStatus {
    Matched,
    /// The endpoint serves another chain and has been disabled
    Mismatched,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainCheck {
    pub endpoint: String,
    pub chain_id: Option<u64>,
    pub status: ChainCheckStatus,
    pub error: Option<String>,
}

#[derive(Debug)]
struct AttemptFailure {
    endpoint: String,
    error: RpcError,
    class: FailureClass,
}

enum Handle {
    Pooled(ConnectionLease),
    Direct(Connection),
}

impl Handle {
    fn connection(&self) -> &Connection {
        match self {
            Handle::Pooled(lease) => lease.connection(),
            Handle::Direct(connection) => connection,
        }
    }
}

/// Reliable executor of RPC operations over several endpoints
pub struct RpcDispatcher {
    config: RpcConfig,
    registry: Arc<EndpointRegistry>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthMetrics>,
    metrics: Arc<RpcMetrics>,
    monitor: HealthMonitor,
    active: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl RpcDispatcher {
    /// Create a dispatcher talking JSON-RPC over HTTP. The monitor is not started.
    pub fn new(config: RpcConfig) -> RpcResult<Self> {
        let connector = HttpConnector::new(config.retry.call_timeout())?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create a dispatcher on top of a custom connection factory
    pub fn with_connector(config: RpcConfig, factory: Arc<dyn ConnectionFactory>) -> RpcResult<Self> {
        config.validate()?;

        let registry = Arc::new(EndpointRegistry::new(&config.endpoints, config.health.clone())?);
        let pool = Arc::new(ConnectionPool::new(
            &config.endpoints,
            registry.clone(),
            factory,
            config.pool.clone(),
        ));
        let health = Arc::new(HealthMetrics::new(config.health.latency_smoothing));
        let monitor = HealthMonitor::new(
            registry.clone(),
            health.clone(),
            pool.clone(),
            config.monitor.clone(),
        );

        info!(endpoints = config.endpoints.len(), "RPC dispatcher initialized");

        Ok(Self {
            config,
            registry,
            pool,
            health,
            metrics: Arc::new(RpcMetrics::new()),
            monitor,
            active: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Create a dispatcher, validate the chain of every endpoint and start
    /// the background monitor if enabled
    pub async fn connect(config: RpcConfig) -> RpcResult<Self> {
        let dispatcher = Self::new(config)?;
        if dispatcher.config.expected_chain_id.is_some() {
            dispatcher.validate_chain().await?;
        }
        if dispatcher.config.monitor.enabled {
            dispatcher.start_monitor();
        }
        Ok(dispatcher)
    }

    /// Start the background health monitor
    pub fn start_monitor(&self) -> bool {
        self.monitor.start()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Run `op` with the default retry budget
    pub async fn execute<T, F, Fut>(&self, op: F, description: &str) -> RpcResult<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        self.execute_with_retry(op, self.config.retry.max_retries, description)
            .await
    }

    /// Run `op` with up to `max_retries` attempts.
    ///
    /// Fatal failures are returned unchanged after the first attempt. When
    /// the budget is used up the result is [`RpcError::RetriesExhausted`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        op: F,
        max_retries: u32,
        description: &str,
    ) -> RpcResult<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        if self.is_stopped() {
            return Err(RpcError::PoolClosed);
        }

        self.metrics.record_request_start();

        let pre_delay = self.pre_delay();
        if !pre_delay.is_zero() {
            trace!(operation = description, delay_ms = pre_delay.as_millis() as u64, "Pre-delay");
            sleep(pre_delay).await;
        }

        let retry = &self.config.retry;
        let rate_limit_backoff = Backoff::Linear {
            base: Duration::from_millis(retry.rate_limit_backoff_base_ms),
            step: Duration::from_millis(retry.rate_limit_backoff_step_ms),
        };
        let transient_backoff = Backoff::Linear {
            base: Duration::from_millis(retry.transient_backoff_base_ms),
            step: Duration::from_millis(retry.transient_backoff_step_ms),
        };
        let max_attempts = max_retries.max(1);
        let started = Instant::now();
        let op = &op;

        let result = run_with_retries(
            max_attempts,
            |attempt| async move { self.attempt(op, attempt).await },
            |attempt, failure: &AttemptFailure| {
                self.metrics.record_attempt_failure(failure.class);

                let backoff = match failure.class {
                    FailureClass::Fatal if matches!(failure.error, RpcError::PoolClosed) => {
                        info!(operation = description, attempt, "Dispatcher stopped, abandoning operation");
                        return RetryDecision::Abort;
                    }
                    FailureClass::Fatal => {
                        error!(
                            operation = description,
                            endpoint = %failure.endpoint,
                            error = %failure.error,
                            "Non-retryable error"
                        );
                        return RetryDecision::Abort;
                    }
                    FailureClass::RateLimited => rate_limit_backoff,
                    FailureClass::Transient | FailureClass::Timeout => transient_backoff,
                };

                warn!(
                    operation = description,
                    attempt,
                    max_attempts,
                    endpoint = %failure.endpoint,
                    class = %failure.class,
                    error = %failure.error,
                    "Attempt failed"
                );
                self.rotate(&failure.endpoint);
                RetryDecision::Retry(backoff.delay(attempt))
            },
        )
        .await;

        match result {
            Ok(value) => {
                self.metrics.record_request_success(started.elapsed());
                Ok(value)
            }
            Err(RetryFailure {
                attempts,
                error: failure,
                aborted,
            }) => {
                self.metrics.record_request_failure(failure.class);
                if !aborted {
                    error!(
                        operation = description,
                        attempts,
                        error = %failure.error,
                        "Operation failed after all retries"
                    );
                }
                Err(RetryFailure {
                    attempts,
                    error: failure.error,
                    aborted,
                }
                .into_error(description))
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, op: &F, attempt: u32) -> Result<T, AttemptFailure>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        if self.is_stopped() {
            return Err(AttemptFailure {
                endpoint: String::new(),
                error: RpcError::PoolClosed,
                class: FailureClass::Fatal,
            });
        }

        if attempt > 1 {
            self.metrics.record_retry();
        }

        let endpoint = self.select_endpoint().ok_or_else(|| AttemptFailure {
            endpoint: String::new(),
            error: RpcError::NoEndpoints,
            class: FailureClass::Transient,
        })?;

        let handle = match self.pool.acquire_for(&endpoint.name) {
            Some(lease) => Handle::Pooled(lease),
            None => match self.pool.connect_direct(&endpoint.to_config()) {
                Ok(connection) => {
                    debug!(endpoint = %endpoint.name, "No pooled connection, using a direct one");
                    Handle::Direct(connection)
                }
                Err(error) => {
                    let class = self.classify(&endpoint, &error);
                    self.registry.record_failure(&endpoint.name, class, &error);
                    return Err(AttemptFailure {
                        endpoint: endpoint.name,
                        error,
                        class,
                    });
                }
            },
        };

        let wait = self.registry.reserve_slot(&endpoint.name);
        if !wait.is_zero() {
            trace!(endpoint = %endpoint.name, wait_ms = wait.as_millis() as u64, "Pacing request");
            sleep(wait).await;
        }

        let call_timeout = self.config.retry.call_timeout();
        let start = Instant::now();
        let outcome = match timeout(call_timeout, op(handle.connection().clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout(call_timeout)),
        };

        match outcome {
            Ok(value) => {
                self.registry.record_success(&endpoint.name);
                self.health.record_success(&endpoint.name, start.elapsed());
                if let Handle::Pooled(lease) = &handle {
                    self.pool.report_success(lease);
                }
                Ok(value)
            }
            Err(error) => {
                let class = self.classify(&endpoint, &error);
                if let Handle::Pooled(lease) = &handle {
                    self.pool.report_failure(lease, &error);
                }
                // A fatal error is the caller's problem, not the endpoint's
                if class != FailureClass::Fatal {
                    self.registry.record_failure(&endpoint.name, class, &error);
                    self.health.record_failure(&endpoint.name);
                }
                Err(AttemptFailure {
                    endpoint: endpoint.name,
                    error,
                    class,
                })
            }
        }
    }

    /// Failures of denylisted providers always count as throttling
    fn classify(&self, endpoint: &Endpoint, error: &RpcError) -> FailureClass {
        let class = error.class();
        if class != FailureClass::Fatal && self.config.is_denylisted(&endpoint.url) {
            FailureClass::RateLimited
        } else {
            class
        }
    }

    /// Keep the active endpoint while it is healthy and not throttled,
    /// otherwise take the best one available
    fn select_endpoint(&self) -> Option<Endpoint> {
        let cooldown = self.config.health.rate_limit_cooldown();
        let healthy = self.registry.list_healthy();

        let mut active = self.active.lock();
        let chosen = active
            .as_deref()
            .and_then(|name| {
                healthy
                    .iter()
                    .find(|e| e.name == name && !e.is_rate_limited(cooldown))
            })
            .or_else(|| healthy.iter().find(|e| !e.is_rate_limited(cooldown)))
            .or_else(|| healthy.first())?
            .clone();

        if active.as_deref() != Some(chosen.name.as_str()) {
            info!(endpoint = %chosen.name, priority = chosen.priority, "Using endpoint");
            *active = Some(chosen.name.clone());
        }
        drop(active);

        self.metrics.set_active_provider(&chosen.name);
        Some(chosen)
    }

    /// Move away from a failed endpoint
    fn rotate(&self, failed: &str) {
        let cooldown = self.config.health.rate_limit_cooldown();
        let next = self
            .registry
            .list_healthy()
            .into_iter()
            .find(|e| e.name != failed && !e.is_rate_limited(cooldown));

        let mut active = self.active.lock();
        match next {
            Some(next) => {
                info!(from = %failed, to = %next.name, "Rotating endpoint");
                *active = Some(next.name.clone());
                drop(active);
                self.metrics.set_active_provider(&next.name);
            }
            None => {
                debug!(endpoint = %failed, "No alternative endpoint to rotate to");
                *active = None;
            }
        }
    }

    fn pre_delay(&self) -> Duration {
        let min = self.config.retry.pre_delay_min_ms;
        let max = self.config.retry.pre_delay_max_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        let ms = if min >= max {
            max
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        Duration::from_millis(ms)
    }

    /// Run operations one after another with a growing pause between them.
    ///
    /// Each item gets the per-item retry budget. Under
    /// [`SequencePolicy::BestEffort`] failed items are logged and left out of
    /// the result; under [`SequencePolicy::Strict`] the first failure is
    /// returned.
    pub async fn execute_sequentially<T, F, Fut>(
        &self,
        operations: Vec<F>,
        operation_name: &str,
        delay_between_ops: Duration,
        policy: SequencePolicy,
    ) -> RpcResult<Vec<T>>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        let total = operations.len();
        let mut results = Vec::with_capacity(total);
        let mut failed = 0usize;

        for (index, op) in operations.into_iter().enumerate() {
            if index > 0 {
                let delay = self.sequence_delay(delay_between_ops, index);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            let description = format!("{} [{}/{}]", operation_name, index + 1, total);
            match self
                .execute_with_retry(op, self.config.sequence.per_item_retries, &description)
                .await
            {
                Ok(value) => results.push(value),
                Err(e) => match policy {
                    SequencePolicy::BestEffort => {
                        failed += 1;
                        warn!(operation = %description, error = %e, "Skipping failed item");
                    }
                    SequencePolicy::Strict => {
                        error!(operation = %description, error = %e, "Sequence aborted");
                        return Err(e);
                    }
                },
            }
        }

        if failed > 0 {
            info!(
                operation = operation_name,
                succeeded = results.len(),
                failed,
                "Sequence finished with skipped items"
            );
        }
        Ok(results)
    }

    /// `base + step * index`, capped
    fn sequence_delay(&self, base: Duration, index: usize) -> Duration {
        let sequence = &self.config.sequence;
        let step = Duration::from_millis(sequence.delay_step_ms).saturating_mul(index as u32);
        let cap = Duration::from_millis(sequence.max_delay_ms).max(base);
        base.saturating_add(step).min(cap)
    }

    /// Check every enabled endpoint against the expected chain ID.
    ///
    /// Endpoints serving another chain are disabled. Fails only if no
    /// enabled endpoint is left.
    pub async fn validate_chain(&self) -> RpcResult<Vec<ChainCheck>> {
        let Some(expected) = self.config.expected_chain_id else {
            return Ok(Vec::new());
        };
        let probe_timeout = self.config.monitor.probe_timeout();

        let mut checks = Vec::new();
        for endpoint in self.registry.endpoints() {
            if !endpoint.enabled {
                continue;
            }

            let result = match self.pool.connect_direct(&endpoint.to_config()) {
                Ok(connection) => match timeout(probe_timeout, connection.chain_id()).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::Timeout(probe_timeout)),
                },
                Err(e) => Err(e),
            };

            let check = match result {
                Ok(actual) if actual == expected => {
                    debug!(endpoint = %endpoint.name, chain_id = actual, "Chain ID verified");
                    ChainCheck {
                        endpoint: endpoint.name.clone(),
                        chain_id: Some(actual),
                        status: ChainCheckStatus::Matched,
                        error: None,
                    }
                }
                Ok(actual) => {
                    let mismatch = RpcError::ChainMismatch {
                        endpoint: endpoint.name.clone(),
                        expected,
                        actual,
                    };
                    warn!(error = %mismatch, "Disabling endpoint");
                    self.registry.set_enabled(&endpoint.name, false);
                    ChainCheck {
                        endpoint: endpoint.name.clone(),
                        chain_id: Some(actual),
                        status: ChainCheckStatus::Mismatched,
                        error: Some(mismatch.to_string()),
                    }
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "Could not verify chain ID");
                    self.registry.record_failure(&endpoint.name, e.class(), &e);
                    ChainCheck {
                        endpoint: endpoint.name.clone(),
                        chain_id: None,
                        status: ChainCheckStatus::Unreachable,
                        error: Some(e.to_string()),
                    }
                }
            };
            checks.push(check);
        }

        if !self.registry.endpoints().iter().any(|e| e.enabled) {
            return Err(RpcError::NoEndpoints);
        }
        Ok(checks)
    }

    pub fn get_metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_endpoint_status(&self) -> Vec<EndpointStatus> {
        self.registry.status()
    }

    pub fn health_report(&self) -> Vec<EndpointHealthReport> {
        self.health.report()
    }

    pub fn pool_status(&self) -> BTreeMap<String, PoolStatus> {
        self.pool.status()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the monitor and release pooled connections. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.monitor.stop().await;
        self.pool.close();
        info!("RPC dispatcher stopped");
    }
}
