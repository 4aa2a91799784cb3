//! Minimal JSON-RPC 2.0 transport over HTTP
//!
//! Shared by the faucet chain client and the health detector. Transport
//! failures are split by whether the request could have reached the node,
//! because callers that submit transactions must treat the two differently.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC call failures
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The connection could not be established; the request was never delivered.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The request may have been delivered but no usable response came back.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node answered but the payload did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RpcError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            RpcError::Unreachable(err.to_string())
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}

/// HTTP JSON-RPC client bound to one endpoint
pub struct RpcTransport {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and return the `result` member, which may be `null`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(RpcError::from_reqwest)?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(format!("unreadable response body: {}", e)))?;

        if let Some(error) = body.get("error") {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            });
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Parse a `0x`-prefixed hex quantity such as `"0x1a"`.
pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected hex quantity, got {}", value)))?;
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Decode(format!("bad quantity {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), 26);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), 0);
        assert!(parse_quantity(&json!("0xzz")).is_err());
        assert!(parse_quantity(&json!(12)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // nothing listens on port 9 (discard) in the test environment
        let transport = RpcTransport::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = transport.call("eth_chainId", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable(_)), "got {:?}", err);
    }
}
