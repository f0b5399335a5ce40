//! Connection pool
//!
//! A fixed number of connections is created per endpoint at construction.
//! Bookkeeping is synchronous and never held across an `.await`; a
//! connection is handed out as a [`ConnectionLease`] and cannot be leased
//! twice while the lease is alive.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, PoolConfig};
use crate::endpoints::EndpointRegistry;
use crate::error::{FailureClass, RpcError, RpcResult};
use crate::retry::{run_with_retries, Backoff, RetryDecision};
use crate::transport::{Connection, ConnectionFactory, ConnectionId};

#[derive(Debug)]
struct PooledConnection {
    connection: Connection,
    healthy: bool,
    error_count: u32,
    last_used_at: Option<Instant>,
    in_use: bool,
}

type Slots = Arc<Mutex<Vec<PooledConnection>>>;

/// Healthy and total connections of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub healthy: usize,
    pub total: usize,
}

/// Exclusive loan of a pooled connection, returned on drop
pub struct ConnectionLease {
    connection: Connection,
    slots: Weak<Mutex<Vec<PooledConnection>>>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            let id = self.connection.id();
            if let Some(slot) = slots.lock().iter_mut().find(|s| s.connection.id() == id) {
                slot.in_use = false;
            }
        }
    }
}

/// Connection pool
pub struct ConnectionPool {
    slots: Slots,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<EndpointRegistry>,
    config: PoolConfig,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create `size_per_endpoint` connections for every endpoint.
    ///
    /// Endpoints whose transport cannot be built are skipped with a warning;
    /// callers can still reach them through [`ConnectionPool::connect_direct`].
    pub fn new(
        endpoints: &[EndpointConfig],
        registry: Arc<EndpointRegistry>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Self {
        let pool = Self {
            slots: Arc::new(Mutex::new(Vec::new())),
            factory,
            registry,
            config,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };

        let mut slots = Vec::with_capacity(endpoints.len() * pool.config.size_per_endpoint);
        for endpoint in endpoints {
            for _ in 0..pool.config.size_per_endpoint {
                match pool.connect_direct(endpoint) {
                    Ok(connection) => slots.push(PooledConnection {
                        connection,
                        healthy: true,
                        error_count: 0,
                        last_used_at: None,
                        in_use: false,
                    }),
                    Err(e) => {
                        warn!(endpoint = %endpoint.name, error = %e, "Failed to create pooled connection");
                        break;
                    }
                }
            }
        }

        info!(
            connections = slots.len(),
            endpoints = endpoints.len(),
            "Connection pool initialized"
        );
        *pool.slots.lock() = slots;
        pool
    }

    /// Create an unpooled connection to an endpoint
    pub fn connect_direct(&self, endpoint: &EndpointConfig) -> RpcResult<Connection> {
        let transport = self.factory.connect(endpoint)?;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Connection::new(id, endpoint.name.as_str(), transport))
    }

    /// Lease the best healthy connection across all endpoints
    pub fn acquire(&self) -> Option<ConnectionLease> {
        self.acquire_matching(|_| true)
    }

    /// Lease the best healthy connection of one endpoint
    pub fn acquire_for(&self, endpoint: &str) -> Option<ConnectionLease> {
        self.acquire_matching(|name| name == endpoint)
    }

    fn acquire_matching(&self, filter: impl Fn(&str) -> bool) -> Option<ConnectionLease> {
        if self.is_closed() {
            return None;
        }

        let disabled: HashSet<String> = self
            .registry
            .endpoints()
            .into_iter()
            .filter(|e| !e.enabled)
            .map(|e| e.name)
            .collect();

        let mut slots = self.slots.lock();
        let best = slots
            .iter_mut()
            .filter(|s| s.healthy && !s.in_use)
            .filter(|s| filter(s.connection.endpoint()))
            .filter(|s| !disabled.contains(s.connection.endpoint()))
            .min_by_key(|s| (s.error_count, s.last_used_at))?;

        best.in_use = true;
        best.last_used_at = Some(Instant::now());
        debug!(connection = %best.connection.id(), endpoint = %best.connection.endpoint(), "Acquired connection");

        Some(ConnectionLease {
            connection: best.connection.clone(),
            slots: Arc::downgrade(&self.slots),
        })
    }

    /// Mark the leased connection as working
    pub fn report_success(&self, lease: &ConnectionLease) {
        self.update(lease.id(), |slot| {
            slot.healthy = true;
            slot.error_count = slot.error_count.saturating_sub(1);
        });
    }

    /// Penalize the leased connection if the error concerns the connection itself
    pub fn report_failure(&self, lease: &ConnectionLease, error: &RpcError) {
        if !error.is_connection_error() {
            return;
        }
        self.update(lease.id(), |slot| {
            slot.healthy = false;
            slot.error_count += 1;
            debug!(
                connection = %slot.connection.id(),
                errors = slot.error_count,
                "Connection marked unhealthy"
            );
        });
    }

    fn update(&self, id: ConnectionId, f: impl FnOnce(&mut PooledConnection)) {
        if let Some(slot) = self.slots.lock().iter_mut().find(|s| s.connection.id() == id) {
            f(slot);
        }
    }

    /// Reset connections that crossed the recovery threshold.
    ///
    /// Unhealthy connections of an endpoint that is itself healthy and
    /// error-free are restored too. Returns the number of connections reset.
    pub fn attempt_connection_recovery(&self) -> usize {
        let clean_endpoints: HashSet<String> = self
            .registry
            .endpoints()
            .into_iter()
            .filter(|e| e.enabled && e.healthy && e.consecutive_errors == 0)
            .map(|e| e.name)
            .collect();

        let threshold = self.config.recovery_error_threshold;
        let mut recovered = 0;
        for slot in self.slots.lock().iter_mut() {
            let over_threshold = slot.error_count > threshold;
            let endpoint_clean = !slot.healthy && clean_endpoints.contains(slot.connection.endpoint());
            if over_threshold || endpoint_clean {
                slot.error_count = 0;
                slot.healthy = true;
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Connection recovery pass reset connections");
        }
        recovered
    }

    /// Run `op` on pooled connections with exponential backoff.
    ///
    /// Fatal errors are returned as-is after the first attempt.
    pub async fn execute<T, F, Fut>(&self, op: F, max_retries: u32) -> RpcResult<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        let backoff = Backoff::Exponential {
            base: std::time::Duration::from_millis(self.config.backoff_base_ms),
            max: std::time::Duration::from_millis(self.config.backoff_max_ms),
        };
        let call_timeout = self.config.call_timeout();
        let op = &op;

        let result = run_with_retries(
            max_retries,
            |attempt| async move {
                let lease = self.acquire_or_recover().await?;
                debug!(attempt, connection = %lease.id(), "Pooled attempt");

                let outcome = match timeout(call_timeout, op(lease.connection().clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RpcError::Timeout(call_timeout)),
                };
                match outcome {
                    Ok(value) => {
                        self.report_success(&lease);
                        Ok(value)
                    }
                    Err(e) => {
                        self.report_failure(&lease, &e);
                        Err(e)
                    }
                }
            },
            |attempt, err: &RpcError| {
                if err.class() == FailureClass::Fatal {
                    RetryDecision::Abort
                } else {
                    warn!(attempt, error = %err, "Pooled call failed, retrying");
                    RetryDecision::Retry(backoff.delay(attempt))
                }
            },
        )
        .await;

        result.map_err(|failure| failure.into_error("Pooled call"))
    }

    async fn acquire_or_recover(&self) -> RpcResult<ConnectionLease> {
        if self.is_closed() {
            return Err(RpcError::PoolClosed);
        }
        if let Some(lease) = self.acquire() {
            return Ok(lease);
        }

        self.attempt_connection_recovery();
        sleep(self.config.recovery_cooldown()).await;
        self.acquire().ok_or(RpcError::NoHealthyConnection)
    }

    /// Healthy and total connections per endpoint
    pub fn status(&self) -> BTreeMap<String, PoolStatus> {
        let mut status: BTreeMap<String, PoolStatus> = BTreeMap::new();
        for slot in self.slots.lock().iter() {
            let entry = status
                .entry(slot.connection.endpoint().to_string())
                .or_insert(PoolStatus { healthy: 0, total: 0 });
            entry.total += 1;
            if slot.healthy {
                entry.healthy += 1;
            }
        }
        status
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every pooled connection; later acquires return nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = {
            let mut slots = self.slots.lock();
            let released = slots.len();
            slots.clear();
            released
        };
        info!(released, "Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::test_utils::{test_config, url, MockConnector};
    use serde_json::json;
    use std::time::Duration;

    fn pool(endpoints: u32, connector: &MockConnector) -> ConnectionPool {
        let config = test_config(endpoints);
        let registry =
            Arc::new(EndpointRegistry::new(&config.endpoints, HealthConfig::default()).unwrap());
        ConnectionPool::new(
            &config.endpoints,
            registry,
            Arc::new(connector.clone()),
            config.pool,
        )
    }

    #[test]
    fn test_fixed_size_per_endpoint() {
        let connector = MockConnector::new();
        let pool = pool(2, &connector);

        let status = pool.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status["ep1"], PoolStatus { healthy: 3, total: 3 });
        assert_eq!(status["ep2"], PoolStatus { healthy: 3, total: 3 });
        assert_eq!(connector.connects(), 6);
    }

    #[test]
    fn test_recovery_resets_degraded_connections() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);
        for slot in pool.slots.lock().iter_mut() {
            slot.error_count = 6;
            slot.healthy = false;
        }
        assert!(pool.acquire().is_none());

        assert_eq!(pool.attempt_connection_recovery(), 3);
        assert!(pool
            .slots
            .lock()
            .iter()
            .all(|s| s.error_count == 0 && s.healthy));
        assert_eq!(pool.status()["ep1"], PoolStatus { healthy: 3, total: 3 });
    }

    #[test]
    fn test_recovery_leaves_mildly_degraded_connections_of_failing_endpoint() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);
        pool.registry.record_failure(
            "ep1",
            FailureClass::Transient,
            &RpcError::Network("reset".into()),
        );
        for slot in pool.slots.lock().iter_mut() {
            slot.error_count = 2;
            slot.healthy = false;
        }

        assert_eq!(pool.attempt_connection_recovery(), 0);
        assert_eq!(pool.status()["ep1"].healthy, 0);
    }

    #[test]
    fn test_acquire_prefers_fewest_errors_then_least_recent() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);

        let first = pool.acquire().unwrap();
        let first_id = first.id();
        drop(first);

        // The next two acquisitions go to untouched connections
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();
        assert_ne!(second.id(), first_id);
        assert_ne!(third.id(), first_id);
        assert_ne!(second.id(), third.id());

        pool.report_failure(&second, &RpcError::Network("reset".into()));
        let second_id = second.id();
        drop(second);
        drop(third);

        // Unhealthy connection is skipped entirely
        for _ in 0..4 {
            let lease = pool.acquire().unwrap();
            assert_ne!(lease.id(), second_id);
        }
    }

    #[test]
    fn test_lease_is_exclusive() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);

        let leases: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());

        drop(leases);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_non_connection_errors_do_not_penalize() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);

        let lease = pool.acquire().unwrap();
        pool.report_failure(&lease, &RpcError::call("execution reverted"));
        drop(lease);
        assert_eq!(pool.status()["ep1"].healthy, 3);
    }

    #[test]
    fn test_disabled_endpoint_connections_are_skipped() {
        let connector = MockConnector::new();
        let pool = pool(2, &connector);
        pool.registry.set_enabled("ep1", false);

        for _ in 0..5 {
            assert_eq!(pool.acquire().unwrap().endpoint(), "ep2");
        }
        assert!(pool.acquire_for("ep1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_with_exponential_backoff() {
        let connector = MockConnector::new();
        connector.on(&url(1), |_, index| {
            if index < 2 {
                Err(RpcError::Network("connection reset".into()))
            } else {
                Ok(json!("0x2a"))
            }
        });
        let pool = pool(1, &connector);

        let start = Instant::now();
        let value = pool
            .execute(|conn| async move { conn.block_number().await }, 3)
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(connector.calls(&url(1)), 3);
        // 2s after the first failure, 4s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        // Two connections were marked unhealthy along the way
        assert_eq!(pool.status()["ep1"].healthy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stops_on_fatal_error() {
        let connector = MockConnector::new();
        connector.on(&url(1), |_, _| Err(RpcError::call("insufficient funds for gas")));
        let pool = pool(1, &connector);

        let err = pool
            .execute(|conn| async move { conn.request("eth_sendRawTransaction", json!([])).await }, 5)
            .await
            .unwrap_err();

        assert_eq!(connector.calls(&url(1)), 1);
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_recovery_when_pool_is_exhausted() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);
        for slot in pool.slots.lock().iter_mut() {
            slot.error_count = 6;
            slot.healthy = false;
        }

        let start = Instant::now();
        let value = pool
            .execute(|conn| async move { conn.block_number().await }, 1)
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close() {
        let connector = MockConnector::new();
        let pool = pool(1, &connector);
        pool.close();
        pool.close();

        assert!(pool.acquire().is_none());
        assert!(pool.status().is_empty());
        let err = pool
            .execute(|conn| async move { conn.block_number().await }, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::PoolClosed));
    }
}
