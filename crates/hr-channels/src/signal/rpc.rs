//! JSON-RPC 2.0 client for the signal daemon's local HTTP endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// `finishLink` blocks until the human scans; give it a long leash.
const LINK_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Error, Debug)]
pub enum RpcError {
    /// The daemon was unreachable or the HTTP exchange failed. Retryable.
    #[error("rpc transport error: {0}")]
    Transport(String),

    /// The daemon answered with a protocol-level error. Not retryable.
    #[error("rpc error {code}: {message}")]
    Remote { code: i64, message: String },
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Thin JSON-RPC caller; one instance per running daemon.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/api/v1/rpc", base_url),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, RPC_TIMEOUT).await
    }

    /// Device-link calls block on human interaction and use a longer timeout.
    pub async fn call_link(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, LINK_TIMEOUT).await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("daemon answered HTTP {}", status)));
        }

        let parsed: RpcResponse =
            response.json().await.map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(RpcError::Remote { code: error.code, message: error.message });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

/// Per-recipient result kinds of a `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResultKind {
    Success,
    NetworkFailure,
    UnregisteredFailure,
    IdentityFailure,
    ProofRequiredFailure,
    Other,
}

impl SendResultKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "SUCCESS" => SendResultKind::Success,
            "NETWORK_FAILURE" => SendResultKind::NetworkFailure,
            "UNREGISTERED_FAILURE" => SendResultKind::UnregisteredFailure,
            "IDENTITY_FAILURE" => SendResultKind::IdentityFailure,
            "PROOF_REQUIRED_FAILURE" => SendResultKind::ProofRequiredFailure,
            _ => SendResultKind::Other,
        }
    }

    /// Only network-level failures are worth re-queueing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendResultKind::NetworkFailure)
    }
}

/// The parsed outcome of one `send` call.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub kind: SendResultKind,
    /// Platform timestamp; doubles as the platform message id.
    pub timestamp: Option<u64>,
}

impl SendOutcome {
    pub fn from_result(result: &Value) -> Self {
        let timestamp = result.get("timestamp").and_then(Value::as_u64);
        let kind = result
            .get("results")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("type"))
            .and_then(Value::as_str)
            .map(SendResultKind::parse)
            // A bare timestamp with no per-recipient entries still means sent.
            .unwrap_or(if timestamp.is_some() {
                SendResultKind::Success
            } else {
                SendResultKind::Other
            });
        Self { kind, timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_result_kinds_classify_retryability() {
        assert!(SendResultKind::parse("NETWORK_FAILURE").is_retryable());
        assert!(!SendResultKind::parse("UNREGISTERED_FAILURE").is_retryable());
        assert!(!SendResultKind::parse("IDENTITY_FAILURE").is_retryable());
        assert!(!SendResultKind::parse("PROOF_REQUIRED_FAILURE").is_retryable());
        assert!(!SendResultKind::parse("SUCCESS").is_retryable());
        assert!(!SendResultKind::parse("SOMETHING_ELSE").is_retryable());
    }

    #[test]
    fn send_outcome_extracts_timestamp_and_kind() {
        let result = json!({
            "timestamp": 1700000001000u64,
            "results": [{"type": "SUCCESS", "recipientAddress": {"number": "+1555"}}]
        });
        let outcome = SendOutcome::from_result(&result);
        assert_eq!(outcome.kind, SendResultKind::Success);
        assert_eq!(outcome.timestamp, Some(1_700_000_001_000));
    }

    #[test]
    fn bare_timestamp_counts_as_success() {
        let outcome = SendOutcome::from_result(&json!({"timestamp": 42u64}));
        assert_eq!(outcome.kind, SendResultKind::Success);
    }
}
