//! Background endpoint monitoring
//!
//! The monitor probes every enabled endpoint with `eth_blockNumber` on a
//! fixed interval, one endpoint at a time, and feeds the outcome into the
//! endpoint registry and the health samples. Between probe cycles it decays
//! old errors and runs a pool recovery pass; every report interval it logs
//! the aggregated health of all endpoints.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::endpoints::EndpointRegistry;
use crate::error::RpcError;
use crate::health::HealthMetrics;
use crate::pool::ConnectionPool;
use crate::transport::Connection;

/// Result of probing one endpoint
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub latency: Duration,
    pub block_number: Option<u64>,
    pub error: Option<RpcError>,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct Prober {
    registry: Arc<EndpointRegistry>,
    health: Arc<HealthMetrics>,
    pool: Arc<ConnectionPool>,
    probes: Vec<Connection>,
    config: MonitorConfig,
}

impl Prober {
    async fn check_all(&self) -> Vec<ProbeOutcome> {
        let mut outcomes = Vec::with_capacity(self.probes.len());

        for probe in &self.probes {
            let enabled = self
                .registry
                .get(probe.endpoint())
                .map(|e| e.enabled)
                .unwrap_or(false);
            if !enabled {
                continue;
            }

            if !outcomes.is_empty() && !self.config.probe_delay().is_zero() {
                sleep(self.config.probe_delay()).await;
            }

            outcomes.push(self.check(probe).await);
        }

        outcomes
    }

    async fn check(&self, probe: &Connection) -> ProbeOutcome {
        let name = probe.endpoint();
        let probe_timeout = self.config.probe_timeout();
        let start = Instant::now();

        let result = match timeout(probe_timeout, probe.block_number()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(probe_timeout)),
        };
        let latency = start.elapsed();

        match result {
            Ok(block_number) => {
                self.registry.record_success(name);
                self.health.record_success(name, latency);
                debug!(endpoint = %name, block_number, latency_ms = latency.as_millis() as u64, "Probe succeeded");
                ProbeOutcome {
                    endpoint: name.to_string(),
                    latency,
                    block_number: Some(block_number),
                    error: None,
                }
            }
            Err(e) => {
                self.registry.record_failure(name, e.class(), &e);
                self.health.record_failure(name);
                warn!(endpoint = %name, error = %e, "Probe failed");
                ProbeOutcome {
                    endpoint: name.to_string(),
                    latency,
                    block_number: None,
                    error: Some(e),
                }
            }
        }
    }

    async fn run_cycle(&self) -> Vec<ProbeOutcome> {
        let outcomes = self.check_all().await;
        self.registry.decay_errors();
        self.pool.attempt_connection_recovery();

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        debug!(probed = outcomes.len(), failed, "Health check cycle finished");
        outcomes
    }
}

/// Background health monitor
pub struct HealthMonitor {
    prober: Arc<Prober>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor with one dedicated probe connection per endpoint
    pub fn new(
        registry: Arc<EndpointRegistry>,
        health: Arc<HealthMetrics>,
        pool: Arc<ConnectionPool>,
        config: MonitorConfig,
    ) -> Self {
        let probes = registry
            .endpoints()
            .iter()
            .filter_map(|endpoint| match pool.connect_direct(&endpoint.to_config()) {
                Ok(connection) => Some(connection),
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "Failed to create probe connection");
                    None
                }
            })
            .collect();

        Self {
            prober: Arc::new(Prober {
                registry,
                health,
                pool,
                probes,
                config,
            }),
            shutdown_tx: Mutex::new(None),
            task_handle: Mutex::new(None),
        }
    }

    /// Probe every enabled endpoint once, sequentially
    pub async fn check_all(&self) -> Vec<ProbeOutcome> {
        self.prober.check_all().await
    }

    /// One monitor cycle: probes, error decay and pool recovery
    pub async fn run_cycle(&self) -> Vec<ProbeOutcome> {
        self.prober.run_cycle().await
    }

    /// Start the background loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut shutdown_guard = self.shutdown_tx.lock();
        if shutdown_guard.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *shutdown_guard = Some(shutdown_tx);
        drop(shutdown_guard);

        let prober = self.prober.clone();
        let handle = tokio::spawn(async move {
            let mut check_interval = interval(prober.config.interval());
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut report_interval = interval(prober.config.report_interval());
            report_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // The first report tick fires immediately
            report_interval.tick().await;

            info!(
                interval_ms = prober.config.interval_ms,
                endpoints = prober.probes.len(),
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = check_interval.tick() => {
                        tokio::select! {
                            _ = prober.run_cycle() => {}
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                    _ = report_interval.tick() => {
                        prober.health.log_report();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            info!("Health monitor stopped");
        });

        *self.task_handle.lock() = Some(handle);
        true
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Stop the background loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }

        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Health monitor task ended abnormally");
                }
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::error::FailureClass;
    use crate::test_utils::{test_config, url, MockConnector};

    fn monitor(endpoints: u32, connector: &MockConnector) -> (HealthMonitor, Arc<EndpointRegistry>, Arc<HealthMetrics>) {
        let config = test_config(endpoints);
        let registry =
            Arc::new(EndpointRegistry::new(&config.endpoints, HealthConfig::default()).unwrap());
        let health = Arc::new(HealthMetrics::new(0.2));
        let pool = Arc::new(ConnectionPool::new(
            &config.endpoints,
            registry.clone(),
            Arc::new(connector.clone()),
            config.pool,
        ));
        let monitor = HealthMonitor::new(registry.clone(), health.clone(), pool, config.monitor);
        (monitor, registry, health)
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_are_sequential_and_spaced() {
        let connector = MockConnector::new();
        let (monitor, _, health) = monitor(3, &connector);

        let start = Instant::now();
        let outcomes = monitor.check_all().await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_success() && o.block_number == Some(1)));
        // Two 50ms gaps between three probes
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        for i in 1..=3 {
            assert_eq!(connector.calls(&url(i)), 1);
            assert_eq!(health.sample(&format!("ep{}", i)).unwrap().total_checks, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_endpoint_becomes_unhealthy() {
        let connector = MockConnector::new();
        connector.on(&url(1), |_, _| Err(RpcError::Network("connection refused".into())));
        let (monitor, registry, health) = monitor(2, &connector);

        for _ in 0..3 {
            monitor.check_all().await;
        }

        assert!(!registry.get("ep1").unwrap().healthy);
        assert!(registry.get("ep2").unwrap().healthy);
        assert_eq!(health.sample("ep1").unwrap().success_rate(), 0.0);
        assert_eq!(health.sample("ep2").unwrap().success_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let connector = MockConnector::new();
        connector.hang(&url(1));
        let (monitor, registry, _) = monitor(1, &connector);

        let outcomes = monitor.check_all().await;
        let error = outcomes[0].error.as_ref().unwrap();
        assert_eq!(error.class(), FailureClass::Timeout);
        assert_eq!(outcomes[0].latency, Duration::from_secs(5));
        assert_eq!(registry.get("ep1").unwrap().consecutive_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_endpoints_are_not_probed() {
        let connector = MockConnector::new();
        let (monitor, registry, _) = monitor(2, &connector);
        registry.set_enabled("ep1", false);

        let outcomes = monitor.check_all().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].endpoint, "ep2");
        assert_eq!(connector.calls(&url(1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_recovers_endpoint() {
        let connector = MockConnector::new();
        connector.on(&url(1), |_, index| {
            if index < 3 {
                Err(RpcError::Network("connection reset".into()))
            } else {
                Ok(serde_json::json!("0x10"))
            }
        });
        let (monitor, registry, _) = monitor(1, &connector);

        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert!(!registry.get("ep1").unwrap().healthy);

        for _ in 0..3 {
            monitor.check_all().await;
        }
        let endpoint = registry.get("ep1").unwrap();
        assert!(endpoint.healthy);
        assert_eq!(endpoint.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let connector = MockConnector::new();
        let (monitor, _, _) = monitor(2, &connector);

        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        // First cycle runs immediately, the next one after the 30s interval
        sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.calls(&url(1)), 1);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.calls(&url(1)), 2);

        monitor.stop().await;
        assert!(!monitor.is_running());
        monitor.stop().await;

        sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls(&url(1)), 2);
    }
}
