//! JSON-RPC transport and connection handles
//!
//! A [`Connection`] is a cheap, cloneable handle bound to exactly one
//! endpoint. The bytes on the wire are produced by an [`RpcTransport`];
//! [`ConnectionFactory`] is the seam through which the pool, the monitor and
//! tests create transports.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::trace;

use crate::config::EndpointConfig;
use crate::error::{RpcError, RpcResult};

/// Sends a single JSON-RPC request and returns its `result` member
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> RpcResult<Value>;
}

/// Creates transports for endpoints
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn RpcTransport>>;
}

/// Stable identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live handle to one endpoint
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    endpoint: Arc<str>,
    transport: Arc<dyn RpcTransport>,
}

impl Connection {
    pub fn new(id: ConnectionId, endpoint: impl Into<Arc<str>>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            transport,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the endpoint this connection is bound to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a raw JSON-RPC request
    pub async fn request(&self, method: &str, params: Value) -> RpcResult<Value> {
        trace!(connection = %self.id, endpoint = %self.endpoint, method, "Sending request");
        self.transport.request(method, params).await
    }

    /// Current block height
    pub async fn block_number(&self) -> RpcResult<u64> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }

    /// Chain ID served by the endpoint
    pub async fn chain_id(&self) -> RpcResult<u64> {
        let value = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&value)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded JSON-RPC quantity such as `"0x1a"`
pub fn parse_quantity(value: &Value) -> RpcResult<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("Expected hex quantity, got {}", value)))?;
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| RpcError::InvalidResponse(format!("Missing 0x prefix: {}", text)))?;
    if digits.is_empty() {
        return Err(RpcError::InvalidResponse("Empty hex quantity".to_string()));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("Bad hex quantity {}: {}", text, e)))
}

/// Extract `result` from a JSON-RPC 2.0 response envelope
pub fn parse_response(payload: Value) -> RpcResult<Value> {
    let mut object = match payload {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err(RpcError::InvalidResponse(
                "Unexpected batch response".to_string(),
            ))
        }
        other => {
            return Err(RpcError::InvalidResponse(format!(
                "Unexpected response: {}",
                other
            )))
        }
    };

    if let Some(error) = object.remove("error") {
        if !error.is_null() {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(RpcError::JsonRpc { code, message });
        }
    }

    object
        .remove("result")
        .ok_or_else(|| RpcError::InvalidResponse("Response has neither result nor error".to_string()))
}

/// JSON-RPC over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        Ok(Self::with_client(build_client(timeout)?, url, timeout))
    }

    /// Transport sharing an existing client and its connection pool
    pub fn with_client(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn map_error(&self, err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            RpcError::Timeout(self.timeout)
        } else {
            RpcError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(self.timeout)
            } else {
                RpcError::InvalidResponse(e.to_string())
            }
        })?;

        parse_response(payload)
    }
}

fn build_client(timeout: Duration) -> RpcResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RpcError::Network(format!("Failed to build HTTP client: {}", e)))
}

/// Default factory producing [`HttpTransport`]s.
///
/// Every transport clones one `reqwest::Client`, so all connections share
/// its keep-alive pool and TLS configuration.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            client: build_client(request_timeout)?,
            request_timeout,
        })
    }
}

impl ConnectionFactory for HttpConnector {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn RpcTransport>> {
        Ok(Arc::new(HttpTransport::with_client(
            self.client.clone(),
            endpoint.url.clone(),
            self.request_timeout,
        )))
    }
}
