//! Scripted transports for unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::{EndpointConfig, RpcConfig};
use crate::error::RpcResult;
use crate::transport::{ConnectionFactory, RpcTransport};

/// Response script: `(method, per-url call index) -> result`
pub(crate) type Behaviour = Arc<dyn Fn(&str, u64) -> RpcResult<Value> + Send + Sync>;

#[derive(Default)]
struct MockState {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    hanging: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, u64>>,
    connects: AtomicU64,
}

/// Connection factory whose transports answer from per-URL scripts.
///
/// Unscripted URLs answer every request with `"0x1"`.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, url: &str, behaviour: F) -> &Self
    where
        F: Fn(&str, u64) -> RpcResult<Value> + Send + Sync + 'static,
    {
        self.state
            .behaviours
            .lock()
            .insert(url.to_string(), Arc::new(behaviour));
        self
    }

    /// Requests to `url` never complete
    pub fn hang(&self, url: &str) -> &Self {
        self.state.hanging.lock().insert(url.to_string());
        self
    }

    /// Requests that reached `url`
    pub fn calls(&self, url: &str) -> u64 {
        self.state.calls.lock().get(url).copied().unwrap_or(0)
    }

    /// Transports created so far
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::Relaxed)
    }
}

struct MockTransport {
    url: String,
    state: Arc<MockState>,
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn request(&self, method: &str, _params: Value) -> RpcResult<Value> {
        let index = {
            let mut calls = self.state.calls.lock();
            let count = calls.entry(self.url.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };

        if self.state.hanging.lock().contains(&self.url) {
            std::future::pending::<()>().await;
        }

        let behaviour = self.state.behaviours.lock().get(&self.url).cloned();
        match behaviour {
            Some(behaviour) => behaviour(method, index),
            None => Ok(json!("0x1")),
        }
    }
}

impl ConnectionFactory for MockConnector {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn RpcTransport>> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockTransport {
            url: endpoint.url.clone(),
            state: self.state.clone(),
        }))
    }
}

/// URL of the i-th test endpoint
pub(crate) fn url(i: u32) -> String {
    format!("https://rpc{}.test", i)
}

/// `n` endpoints `ep1..epn` with priorities `1..n`, no pre-delay, no
/// background monitor and a rate budget high enough to never throttle.
pub(crate) fn test_config(n: u32) -> RpcConfig {
    let mut config = RpcConfig::default();
    config.endpoints = (1..=n)
        .map(|i| EndpointConfig::new(format!("ep{}", i), url(i), i).with_rate_limit(1000.0))
        .collect();
    config.expected_chain_id = None;
    config.denylisted_hosts.clear();
    config.monitor.enabled = false;
    config.retry.pre_delay_min_ms = 0;
    config.retry.pre_delay_max_ms = 0;
    config
}
