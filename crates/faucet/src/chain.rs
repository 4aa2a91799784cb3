//! Chain client: the faucet's view of the node

use async_trait::async_trait;
use serde_json::{json, Value};
use spigot_common::{parse_quantity, Address, Hash, RpcError, RpcTransport};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Final state of a transaction as far as the node knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Mined and succeeded
    Confirmed { block_number: u64 },
    /// Mined and reverted
    Reverted { block_number: u64 },
    /// No receipt
    Unknown,
}

/// Result of waiting for a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Mined(TxStatus),
    TimedOut,
}

/// Operations the faucet needs from a node
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// Next nonce including transactions still in the pool
    async fn next_sequence_number(&self, account: &Address) -> Result<u64, RpcError>;

    /// Next nonce counting mined transactions only
    async fn confirmed_sequence_number(&self, account: &Address) -> Result<u64, RpcError>;

    /// Broadcast a signed transaction; returns the hash the node reports
    async fn submit_raw_transaction(&self, raw: &[u8]) -> Result<Hash, RpcError>;

    async fn transaction_status(&self, hash: &Hash) -> Result<TxStatus, RpcError>;

    /// Poll for a receipt until `timeout` elapses.
    ///
    /// Transient lookup errors are swallowed while time remains.
    async fn await_confirmation(
        &self,
        hash: &Hash,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Confirmation, RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transaction_status(hash).await {
                Ok(TxStatus::Unknown) => {}
                Ok(status) => return Ok(Confirmation::Mined(status)),
                Err(e) => debug!("Receipt lookup for {} failed: {}", hash, e),
            }
            if Instant::now() + poll_interval > deadline {
                return Ok(Confirmation::TimedOut);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// JSON-RPC client for an Ethereum-compatible node
pub struct JsonRpcChainClient {
    transport: RpcTransport,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            transport: RpcTransport::new(rpc_url, timeout)?,
        })
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    async fn transaction_count(&self, account: &Address, tag: &str) -> Result<u64, RpcError> {
        let result = self
            .transport
            .call("eth_getTransactionCount", json!([account.to_string(), tag]))
            .await?;
        parse_quantity(&result)
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let result = self.transport.call("eth_chainId", json!([])).await?;
        parse_quantity(&result)
    }

    async fn next_sequence_number(&self, account: &Address) -> Result<u64, RpcError> {
        self.transaction_count(account, "pending").await
    }

    async fn confirmed_sequence_number(&self, account: &Address) -> Result<u64, RpcError> {
        self.transaction_count(account, "latest").await
    }

    async fn submit_raw_transaction(&self, raw: &[u8]) -> Result<Hash, RpcError> {
        let result = self
            .transport
            .call("eth_sendRawTransaction", json!([format!("0x{}", hex::encode(raw))]))
            .await?;
        parse_hash(&result)
    }

    async fn transaction_status(&self, hash: &Hash) -> Result<TxStatus, RpcError> {
        let receipt = self
            .transport
            .call("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        receipt_status(&receipt)
    }
}

fn parse_hash(value: &Value) -> Result<Hash, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected transaction hash, got {}", value)))?;
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RpcError::Decode(format!("bad transaction hash {:?}: {}", s, e)))?;
    if bytes.len() != 32 {
        return Err(RpcError::Decode(format!("transaction hash has {} bytes", bytes.len())));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(Hash(arr))
}

/// Interpret an `eth_getTransactionReceipt` result
fn receipt_status(receipt: &Value) -> Result<TxStatus, RpcError> {
    if receipt.is_null() {
        return Ok(TxStatus::Unknown);
    }
    // a receipt without a block is still pending on some nodes
    let block_number = match receipt.get("blockNumber") {
        None | Some(Value::Null) => return Ok(TxStatus::Unknown),
        Some(v) => parse_quantity(v)?,
    };
    // pre-Byzantium receipts carry no status; treat them as success
    match receipt.get("status") {
        None | Some(Value::Null) => Ok(TxStatus::Confirmed { block_number }),
        Some(v) if parse_quantity(v)? == 1 => Ok(TxStatus::Confirmed { block_number }),
        Some(_) => Ok(TxStatus::Reverted { block_number }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_receipt_status() {
        assert_eq!(receipt_status(&Value::Null).unwrap(), TxStatus::Unknown);
        assert_eq!(
            receipt_status(&json!({"blockNumber": null})).unwrap(),
            TxStatus::Unknown
        );
        assert_eq!(
            receipt_status(&json!({"blockNumber": "0x10", "status": "0x1"})).unwrap(),
            TxStatus::Confirmed { block_number: 16 }
        );
        assert_eq!(
            receipt_status(&json!({"blockNumber": "0x10", "status": "0x0"})).unwrap(),
            TxStatus::Reverted { block_number: 16 }
        );
        assert!(receipt_status(&json!({"blockNumber": 5})).is_err());
    }

    #[test]
    fn test_parse_hash() {
        let h = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_hash(&json!(h)).unwrap(), Hash([0xab; 32]));
        assert!(parse_hash(&json!("0x1234")).is_err());
        assert!(parse_hash(&Value::Null).is_err());
    }

    /// Mines on the third lookup
    struct SlowMiner {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ChainClient for SlowMiner {
        async fn chain_id(&self) -> Result<u64, RpcError> {
            Ok(1)
        }
        async fn next_sequence_number(&self, _: &Address) -> Result<u64, RpcError> {
            Ok(0)
        }
        async fn confirmed_sequence_number(&self, _: &Address) -> Result<u64, RpcError> {
            Ok(0)
        }
        async fn submit_raw_transaction(&self, raw: &[u8]) -> Result<Hash, RpcError> {
            Ok(Hash::keccak(raw))
        }
        async fn transaction_status(&self, _: &Hash) -> Result<TxStatus, RpcError> {
            match self.lookups.fetch_add(1, Ordering::SeqCst) {
                0 => Err(RpcError::Transport("flaky".into())),
                1 => Ok(TxStatus::Unknown),
                _ => Ok(TxStatus::Confirmed { block_number: 9 }),
            }
        }
    }

    #[tokio::test]
    async fn test_await_confirmation_polls_until_mined() {
        let client = SlowMiner { lookups: AtomicUsize::new(0) };
        let outcome = client
            .await_confirmation(&Hash::default(), Duration::from_secs(5), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(outcome, Confirmation::Mined(TxStatus::Confirmed { block_number: 9 }));
        assert_eq!(client.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_await_confirmation_times_out() {
        let client = SlowMiner { lookups: AtomicUsize::new(0) };
        let outcome = client
            .await_confirmation(&Hash::default(), Duration::from_millis(8), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(outcome, Confirmation::TimedOut);
    }
}
