//! Node queries behind one poll

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use spigot_common::{parse_quantity, RpcError, RpcTransport};
use std::time::Duration;

/// What one poll learned about the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeSample {
    pub client_version: String,
    pub head_number: u64,
    /// Unix seconds of the head block
    pub head_timestamp: u64,
    pub peer_count: u64,
    /// Blocks between the head and the highest block the node has seen
    pub behind: u64,
    pub network_id: String,
}

#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Address of the node, as shown in reports
    fn endpoint(&self) -> String;

    async fn sample(&self) -> Result<NodeSample, RpcError>;
}

/// Samples a node over JSON-RPC
pub struct JsonRpcProbe {
    transport: RpcTransport,
}

impl JsonRpcProbe {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            transport: RpcTransport::new(rpc_url, timeout)?,
        })
    }
}

#[async_trait]
impl NodeProbe for JsonRpcProbe {
    fn endpoint(&self) -> String {
        self.transport.url().to_string()
    }

    async fn sample(&self) -> Result<NodeSample, RpcError> {
        let version = self.transport.call("web3_clientVersion", json!([])).await?;
        let head_number = parse_quantity(&self.transport.call("eth_blockNumber", json!([])).await?)?;
        let head = self
            .transport
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let peers = self.transport.call("net_peerCount", json!([])).await?;
        let syncing = self.transport.call("eth_syncing", json!([])).await?;
        let network = self.transport.call("net_version", json!([])).await?;

        Ok(NodeSample {
            client_version: as_string(&version, "web3_clientVersion")?,
            head_number,
            head_timestamp: block_timestamp(&head)?,
            peer_count: parse_quantity(&peers)?,
            behind: blocks_behind(&syncing)?,
            network_id: as_string(&network, "net_version")?,
        })
    }
}

fn as_string(value: &Value, method: &str) -> Result<String, RpcError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RpcError::Decode(format!("{} returned {}", method, value)))
}

fn block_timestamp(block: &Value) -> Result<u64, RpcError> {
    match block.get("timestamp") {
        Some(ts) => parse_quantity(ts),
        None => Err(RpcError::Decode(format!("latest block has no timestamp: {}", block))),
    }
}

/// `eth_syncing` is `false` when in sync, otherwise a progress object
fn blocks_behind(syncing: &Value) -> Result<u64, RpcError> {
    match syncing {
        Value::Bool(false) | Value::Null => Ok(0),
        Value::Object(progress) => {
            let field = |name: &str| {
                progress
                    .get(name)
                    .ok_or_else(|| RpcError::Decode(format!("eth_syncing missing {}", name)))
                    .and_then(parse_quantity)
            };
            Ok(field("highestBlock")?.saturating_sub(field("currentBlock")?))
        }
        other => Err(RpcError::Decode(format!("eth_syncing returned {}", other))),
    }
}
