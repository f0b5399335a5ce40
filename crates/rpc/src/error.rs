//! Error types for the RPC layer
//!
//! Every failure coming out of a transport or a consumer operation is an
//! [`RpcError`]. [`RpcError::class`] is the only place where provider
//! messages, HTTP statuses and JSON-RPC codes are inspected; the rest of the
//! crate branches on the resulting [`FailureClass`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result type for the RPC module
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Message fragments that mean the call can never succeed by retrying.
const FATAL_PATTERNS: &[&str] = &[
    "insufficient funds",
    "nonce too low",
    "already known",
    "replacement transaction underpriced",
    "nonce has already been used",
];

/// Vendor error codes (ethers-style) that are never retried.
const FATAL_CODES: &[&str] = &["INSUFFICIENT_FUNDS", "NONCE_EXPIRED", "REPLACEMENT_UNDERPRICED"];

/// Message fragments emitted by throttling providers.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "batch of more than 3",
    "missing response for request",
    "request limit",
    "capacity exceeded",
];

const RATE_LIMIT_CODES: &[&str] = &["RATE_LIMITED"];

/// JSON-RPC error codes used by providers for throttling.
const RATE_LIMIT_RPC_CODES: &[i64] = &[-32005, 429];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];

/// Fragments that point at the socket rather than the provider.
const CONNECTION_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "enotfound",
    "dns",
    "socket hang up",
    "failed to detect network",
];

/// How a failed attempt should be treated by the retry machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    /// Provider throttling; rotate immediately and back off
    RateLimited,

    /// Retrying cannot help (bad nonce, no funds, wrong chain)
    Fatal,

    /// Network or provider hiccup
    Transient,

    /// The call did not finish within its deadline
    Timeout,
}

impl FailureClass {
    /// Whether another attempt may succeed
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Fatal => "fatal",
            FailureClass::Transient => "transient",
            FailureClass::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for the RPC module
#[derive(thiserror::Error, Debug, Clone)]
pub enum RpcError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    /// Failure reported by a consumer operation, optionally carrying a vendor code
    #[error("{message}")]
    Call { code: Option<String>, message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No available endpoints")]
    NoEndpoints,

    #[error("No healthy connection available")]
    NoHealthyConnection,

    #[error("Endpoint {endpoint} serves chain {actual}, expected {expected}")]
    ChainMismatch {
        endpoint: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("{description} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        description: String,
        attempts: u32,
        last_error: Box<RpcError>,
    },
}

impl RpcError {
    /// Consumer-side failure with a plain message
    pub fn call(message: impl Into<String>) -> Self {
        RpcError::Call {
            code: None,
            message: message.into(),
        }
    }

    /// Consumer-side failure carrying a vendor error code
    pub fn call_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Call {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Classify the failure
    pub fn class(&self) -> FailureClass {
        match self {
            RpcError::Timeout(_) => FailureClass::Timeout,
            RpcError::Http { status, body } => {
                if *status == 429 {
                    FailureClass::RateLimited
                } else {
                    classify_text(body, None).unwrap_or(FailureClass::Transient)
                }
            }
            RpcError::JsonRpc { code, message } => {
                if RATE_LIMIT_RPC_CODES.contains(code) {
                    FailureClass::RateLimited
                } else {
                    classify_text(message, None).unwrap_or(FailureClass::Transient)
                }
            }
            RpcError::Call { code, message } => {
                classify_text(message, code.as_deref()).unwrap_or(FailureClass::Transient)
            }
            RpcError::Network(message) => {
                classify_text(message, None).unwrap_or(FailureClass::Transient)
            }
            RpcError::RetriesExhausted { last_error, .. } => last_error.class(),
            RpcError::ChainMismatch { .. } | RpcError::InvalidConfig(_) | RpcError::PoolClosed => {
                FailureClass::Fatal
            }
            RpcError::NoEndpoints
            | RpcError::NoHealthyConnection
            | RpcError::InvalidResponse(_) => FailureClass::Transient,
        }
    }

    /// Whether the failure says the underlying connection itself is broken
    pub fn is_connection_error(&self) -> bool {
        match self {
            RpcError::Network(_) | RpcError::Timeout(_) => true,
            RpcError::Call { message, .. } | RpcError::JsonRpc { message, .. } => {
                let message = message.to_lowercase();
                CONNECTION_PATTERNS.iter().any(|p| message.contains(p))
            }
            RpcError::RetriesExhausted { last_error, .. } => last_error.is_connection_error(),
            _ => false,
        }
    }
}

/// Map provider text and an optional vendor code onto a class.
///
/// Fatal patterns win over rate-limit patterns.
fn classify_text(message: &str, code: Option<&str>) -> Option<FailureClass> {
    let message = message.to_lowercase();

    if let Some(code) = code {
        if FATAL_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return Some(FailureClass::Fatal);
        }
    }
    if FATAL_PATTERNS.iter().any(|p| message.contains(p)) {
        return Some(FailureClass::Fatal);
    }

    if let Some(code) = code {
        if RATE_LIMIT_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return Some(FailureClass::RateLimited);
        }
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Some(FailureClass::RateLimited);
    }

    if TIMEOUT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Some(FailureClass::Timeout);
    }

    None
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::InvalidResponse(err.to_string())
    }
}
