//! Multi-endpoint JSON-RPC reliability layer for governance node wallets
//!
//! This crate keeps blockchain calls working across several public and
//! commercial Ethereum JSON-RPC endpoints:
//! - Endpoint registry with priority ordering and health tracking
//! - Background health monitor with periodic probes and reports
//! - Connection pool with exclusive leases and recovery passes
//! - Dispatcher with error classification, endpoint rotation and bounded retries
//! - Metrics and status snapshots for dashboards
//!
//! Callers construct one [`RpcDispatcher`] per process and pass it by
//! reference to every component that talks to the chain.

mod config;
mod dispatcher;
mod endpoints;
mod error;
mod health;
mod metrics;
mod monitor;
mod pool;
mod retry;
mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{
    EndpointConfig, HealthConfig, MonitorConfig, PoolConfig, RetryConfig, RpcConfig,
    SequenceConfig, SEPOLIA_CHAIN_ID,
};
pub use dispatcher::{ChainCheck, ChainCheckStatus, RpcDispatcher, SequencePolicy};
pub use endpoints::{Endpoint, EndpointRegistry, EndpointStatus};
pub use error::{FailureClass, RpcError, RpcResult};
pub use health::{EndpointHealthReport, HealthMetrics, HealthSample};
pub use metrics::{RpcMetrics, RpcMetricsSnapshot};
pub use monitor::{HealthMonitor, ProbeOutcome};
pub use pool::{ConnectionLease, ConnectionPool, PoolStatus};
pub use retry::{run_with_retries, Backoff, RetryDecision, RetryFailure};
pub use transport::{
    parse_quantity, Connection, ConnectionFactory, ConnectionId, HttpConnector, HttpTransport,
    RpcTransport,
};

use tracing::info;

// Initialize the module
pub fn init() {
    info!("Initializing RPC module");
}
